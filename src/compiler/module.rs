//! Sub-module preparation: injects declared parameters into user script.

use super::flow::{Direction, VariableDef};
use super::params::{ParamCompiler, quote, value_code};

fn leading_spaces(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn is_main_header(line: &str) -> bool {
    let text = line.trim();
    let text = text.split('#').next().unwrap_or("").trim_end();
    text.starts_with("def main(") && text.ends_with(':')
}

/// Insert parameter loading after `def main(args):` and output write-back
/// before the last `return` (or at the end of the function).
///
/// Sources without a `main` header are returned untouched.
pub fn inject_params(
    source: &str,
    params: &[VariableDef],
    compiler: &ParamCompiler<'_>,
    indent_width: usize,
) -> String {
    if params.is_empty() {
        return source.to_string();
    }
    let mut lines: Vec<String> = source.lines().map(str::to_string).collect();
    let Some(header) = lines.iter().position(|l| is_main_header(l)) else {
        return source.to_string();
    };
    let body_indent = " ".repeat(leading_spaces(&lines[header]) + indent_width);

    let loads: Vec<String> = params
        .iter()
        .map(|p| {
            let default = value_code(&compiler.compile_default(p));
            format!(
                "{body_indent}{} = args.get({}, {})",
                p.var_name,
                quote(&p.var_name),
                default
            )
        })
        .collect();
    let load_count = loads.len();
    lines.splice(header + 1..header + 1, loads);

    let outputs: Vec<&VariableDef> = params
        .iter()
        .filter(|p| p.var_direction == Direction::Output)
        .collect();
    if !outputs.is_empty() {
        let body_start = header + 1 + load_count;
        let last_return = lines
            .iter()
            .enumerate()
            .skip(body_start)
            .filter(|(_, l)| {
                let t = l.trim_start();
                t == "return" || t.starts_with("return ")
            })
            .map(|(i, _)| i)
            .last();
        let (at, indent) = match last_return {
            Some(i) => (i, " ".repeat(leading_spaces(&lines[i]))),
            None => (lines.len(), body_indent.clone()),
        };
        let writes: Vec<String> = outputs
            .iter()
            .map(|p| format!("{indent}args[{}] = {}", quote(&p.var_name), p.var_name))
            .collect();
        lines.splice(at..at, writes);
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn var(name: &str, value: serde_json::Value, direction: Direction) -> VariableDef {
        VariableDef {
            var_name: name.into(),
            var_type: "Str".into(),
            var_value: value,
            var_direction: direction,
        }
    }

    #[test]
    fn injects_loads_and_write_back() {
        let globals = BTreeSet::new();
        let compiler = ParamCompiler::new(&globals);
        let source = "def main(args):\n    total = 1\n    return\n";
        let out = inject_params(
            source,
            &[
                var("name", json!("bob"), Direction::Input),
                var("total", json!(0), Direction::Output),
            ],
            &compiler,
            4,
        );
        let expected = [
            "def main(args):",
            "    name = args.get(\"name\", \"bob\")",
            "    total = args.get(\"total\", 0)",
            "    total = 1",
            "    args[\"total\"] = total",
            "    return",
        ]
        .join("\n");
        assert_eq!(out, expected);
    }

    #[test]
    fn leaves_sources_without_main_alone() {
        let globals = BTreeSet::new();
        let compiler = ParamCompiler::new(&globals);
        let source = "x = 1";
        let out = inject_params(source, &[var("a", json!(1), Direction::Input)], &compiler, 4);
        assert_eq!(out, source);
    }
}
