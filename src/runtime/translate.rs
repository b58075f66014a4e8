//! Human-readable failure summaries in the configured locale.

use crate::script::{ErrorKind, ScriptError, TypeIssue};

use super::Locale;

/// Summary of `error` for end users.
///
/// Numeric, type, index, key, attribute, name, import and syntax failures
/// get a localized sentence; everything else passes through verbatim.
pub fn translate(error: &ScriptError, locale: Locale) -> String {
    match locale {
        Locale::En => english(&error.kind),
        Locale::Zh => chinese(&error.kind),
    }
}

fn english(kind: &ErrorKind) -> String {
    match kind {
        ErrorKind::ZeroDivision => "Numeric error: division by zero".to_string(),
        ErrorKind::Type(issue) => format!("Type error: {}", type_detail(issue)),
        ErrorKind::Index { type_name } => {
            format!("Index error: the {type_name} index is out of range")
        }
        ErrorKind::Key { key } => format!("Key error: key '{key}' does not exist"),
        ErrorKind::Attribute { type_name, attr } => {
            format!("Attribute error: '{type_name}' has no attribute '{attr}'")
        }
        ErrorKind::Name { name } => format!("Name error: variable '{name}' is not defined"),
        ErrorKind::Import { module } => format!("Import error: module '{module}' is not available"),
        ErrorKind::Syntax { line, message } => format!("Syntax error at line {line}: {message}"),
        other => other.to_string(),
    }
}

fn chinese(kind: &ErrorKind) -> String {
    match kind {
        ErrorKind::ZeroDivision => "数值错误：除数不能为零".to_string(),
        ErrorKind::Type(issue) => format!("类型错误：{}", type_detail(issue)),
        ErrorKind::Index { type_name } => format!("索引错误：{type_name} 的索引超出范围"),
        ErrorKind::Key { key } => format!("键错误：键 '{key}' 不存在"),
        ErrorKind::Attribute { type_name, attr } => {
            format!("属性错误：'{type_name}' 没有属性 '{attr}'")
        }
        ErrorKind::Name { name } => format!("名称错误：变量 '{name}' 未定义"),
        ErrorKind::Import { module } => format!("导入错误：模块 '{module}' 不可用"),
        ErrorKind::Syntax { line, message } => format!("语法错误（第 {line} 行）：{message}"),
        other => other.to_string(),
    }
}

fn type_detail(issue: &TypeIssue) -> String {
    issue.to_string()
}
