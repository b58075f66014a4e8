//! Weft CLI - Command-line interface for the Weft compiler and engine
//!
//! Provides subcommands for compiling flow projects into artifact
//! directories and for running them, optionally under the debugger.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use weft::compiler::{CompileOptions, CompiledProject, LineSlice, Project, compile_project};
use weft::runtime::report::{TracingObserver, TransportObserver};
use weft::runtime::{
    AtomicBackend, CommandInstaller, DependencyResolver, Engine, EngineConfig, ExecutionHandle,
    Inbound, LocalBackend, Outcome, RemoteBackend, Transport,
};
use weft::script::Value;

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Compiler and stepping runtime for visual automation flows", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a project and write its artifacts
    Compile {
        /// Project JSON file
        project: PathBuf,

        /// Output directory
        #[arg(short, long)]
        out: PathBuf,

        /// Entry process id (default: the process named "main")
        #[arg(long)]
        process: Option<String>,

        /// First flow line of the entry process to keep
        #[arg(long, default_value = "0")]
        start: usize,

        /// Last flow line of the entry process to keep
        #[arg(long, default_value = "0")]
        end: usize,

        /// Compile for the debugger (no retry wrappers)
        #[arg(long)]
        debug: bool,
    },

    /// Run a project JSON file or a compiled artifact directory
    Run {
        /// Project JSON file or artifact directory
        project: PathBuf,

        /// Worker address for atomic operations and reports
        #[arg(long)]
        connect: Option<String>,

        /// Enable breakpoints and read debug commands from stdin
        #[arg(long)]
        debug: bool,

        /// Input arguments as a JSON object
        #[arg(long)]
        args: Option<String>,

        /// Engine configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Do not install package requirements
        #[arg(long)]
        skip_deps: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Compile {
            project,
            out,
            process,
            start,
            end,
            debug,
        } => {
            let project = read_project(&project)?;
            let options = CompileOptions {
                entry_process: process,
                slice: LineSlice { start, end },
                debug_mode: debug,
                ..CompileOptions::default()
            };
            let compiled = compile_project(&project, options)?;
            compiled.write_to(&out)?;
            println!(
                "Compiled {} unit(s) of `{}` into {}",
                compiled.units.len(),
                compiled.name,
                out.display()
            );
        }

        Commands::Run {
            project,
            connect,
            debug,
            args,
            config,
            skip_deps,
        } => {
            let mut config = match config {
                Some(path) => EngineConfig::load(&path)?,
                None => EngineConfig::default(),
            };
            config.debug_mode |= debug;
            let args = parse_args(args.as_deref())?;
            run(&project, config, connect, args, skip_deps)?;
        }
    }

    Ok(())
}

fn read_project(path: &Path) -> Result<Project> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading project {}", path.display()))?;
    Project::from_json(&text).with_context(|| format!("parsing project {}", path.display()))
}

fn parse_args(text: Option<&str>) -> Result<BTreeMap<String, Value>> {
    let Some(text) = text else {
        return Ok(BTreeMap::new());
    };
    match serde_json::from_str(text).context("parsing --args")? {
        serde_json::Value::Object(map) => Ok(map
            .iter()
            .map(|(name, value)| (name.clone(), Value::from_json(value)))
            .collect()),
        other => bail!("--args must be a JSON object, got {other}"),
    }
}

fn run(
    path: &Path,
    config: EngineConfig,
    connect: Option<String>,
    args: BTreeMap<String, Value>,
    skip_deps: bool,
) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    let connection = match &connect {
        Some(addr) => Some(runtime.block_on(async {
            let stream = tokio::net::TcpStream::connect(addr)
                .await
                .with_context(|| format!("connecting to {addr}"))?;
            Ok::<_, anyhow::Error>(Transport::connect(stream, "weft-engine"))
        })?),
        None => None,
    };

    let backend: Arc<dyn AtomicBackend> = match &connection {
        Some((transport, _)) => Arc::new(RemoteBackend::new(transport.clone())),
        None => Arc::new(LocalBackend::new()),
    };
    let mut engine = Engine::new(config.clone(), backend).with_observer(Arc::new(TracingObserver));
    if let Some((transport, _)) = &connection {
        engine = engine.with_observer(Arc::new(TransportObserver::new(transport.clone())));
    }
    if !skip_deps {
        let installer = CommandInstaller::new("pip", config.dependency_timeout());
        engine = engine.with_resolver(Arc::new(DependencyResolver::new(
            Arc::new(installer),
            config.package_cache_dir.clone(),
        )));
    }

    let compiled = if path.is_dir() {
        CompiledProject::load_from(path)?
    } else {
        engine.compile(&read_project(path)?)?
    };
    let handle = Arc::new(engine.start(compiled, args)?);

    if let Some((transport, inbound)) = connection {
        runtime.spawn(serve_debug_commands(transport, inbound, Arc::clone(&handle)));
    }
    if config.debug_mode {
        let handle = Arc::clone(&handle);
        std::thread::spawn(move || read_stdin_commands(&handle));
    }

    let outcome = handle.wait();
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    runtime.shutdown_timeout(Duration::from_secs(1));
    match outcome {
        Outcome::Succeeded { .. } => Ok(()),
        Outcome::Cancelled => Err(anyhow!("execution cancelled")),
        Outcome::Failed(failure) => Err(anyhow!(failure.reason)),
    }
}

/// Apply one debugger command line.
fn apply_command(handle: &ExecutionHandle, command: &str) -> Result<String> {
    let words: Vec<&str> = command.split_whitespace().collect();
    let reply = match words.as_slice() {
        ["continue" | "c"] => {
            handle.resume()?;
            "resumed".to_string()
        }
        ["next" | "n"] => {
            handle.next()?;
            "stepping".to_string()
        }
        ["stop"] => {
            handle.force_stop();
            "stopping".to_string()
        }
        ["break" | "b", unit, line] => {
            let generated = handle.set_breakpoint(unit, line.parse()?)?;
            format!("breakpoint set at generated line {generated}")
        }
        ["clear", unit, line] => {
            if handle.clear_breakpoint(unit, line.parse()?)? {
                "cleared".to_string()
            } else {
                "no breakpoint there".to_string()
            }
        }
        ["state"] => format!("{:?}", handle.state()),
        [] => String::new(),
        _ => bail!("unknown command: {command}"),
    };
    Ok(reply)
}

fn read_stdin_commands(handle: &ExecutionHandle) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if handle.state().is_terminal() {
            break;
        }
        match apply_command(handle, line.trim()) {
            Ok(reply) if reply.is_empty() => {}
            Ok(reply) => eprintln!("{reply}"),
            Err(err) => eprintln!("error: {err}"),
        }
    }
}

async fn serve_debug_commands(transport: Transport, mut inbound: Inbound, handle: Arc<ExecutionHandle>) {
    while let Some(envelope) = inbound.next().await {
        if envelope.channel != "debug" {
            tracing::debug!(channel = %envelope.channel, key = %envelope.key, "ignoring inbound message");
            continue;
        }
        let line = match envelope.payload.get("args").and_then(|a| a.as_str()) {
            Some(args) => format!("{} {args}", envelope.key),
            None => envelope.key.clone(),
        };
        let reply = match apply_command(&handle, &line) {
            Ok(message) => json!({ "ok": true, "result": message }),
            Err(err) => json!({ "ok": false, "error": err.to_string() }),
        };
        if envelope.needs_reply {
            if let Err(err) = transport.reply(&envelope, reply) {
                tracing::warn!(error = %err, "failed to answer debug command");
                break;
            }
        }
    }
}
