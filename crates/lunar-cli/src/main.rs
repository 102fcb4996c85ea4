//! `lunar` — run scripts, list their bytecode, or start an interactive prompt.

use anyhow::{bail, Context, Result};
use clap::Parser;
use lunar_core::{CompilerConfig, LuaError, VmConfig};
use lunar_vm::{Error, Vm};
use rustyline::{error::ReadlineError, DefaultEditor};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "lunar", version, about = "A small Lua interpreter")]
struct Args {
    /// Script to run, or a directory whose `*.lua` files run in order.
    /// Starts the prompt when omitted.
    path: Option<PathBuf>,

    /// Module search prefix; repeat to add more. Defaults to the script's directory.
    #[arg(short = 'I', long = "path", value_name = "DIR")]
    paths: Vec<PathBuf>,

    /// Print the bytecode listing instead of running
    #[arg(short, long)]
    list: bool,

    /// Log filter used when `RUST_LOG` is unset
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Allocations before the first garbage collection
    #[arg(long)]
    gc_threshold: Option<usize>,

    /// Keep arithmetic on literals unfolded
    #[arg(long, default_value_t = false)]
    no_fold: bool,
}

impl Args {
    fn vm_config(&self) -> VmConfig {
        let mut config = VmConfig::default();
        if let Some(threshold) = self.gc_threshold {
            config.gc_initial_threshold = threshold;
        }
        config
    }

    fn compiler_config(&self) -> CompilerConfig {
        CompilerConfig {
            fold_constants: !self.no_fold,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Flatten a runtime error and its traceback into the CLI's error report.
fn vm_error(err: Error) -> anyhow::Error {
    let mut msg = err.to_string();
    if !err.traceback().is_empty() {
        msg.push_str("\nstack traceback:");
        for line in err.traceback() {
            msg.push_str("\n\t");
            msg.push_str(line);
        }
    }
    anyhow::anyhow!(msg)
}

fn run(args: &Args) -> Result<()> {
    let Some(path) = &args.path else {
        let mut vm = new_vm(args, Path::new("."));
        return repl(&mut vm);
    };
    if args.list {
        return list(path, args.compiler_config());
    }
    let dir = if path.is_dir() {
        path.as_path()
    } else {
        path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."))
    };
    let mut vm = new_vm(args, dir);
    vm.run_path(path).map_err(vm_error)
}

fn new_vm(args: &Args, default_dir: &Path) -> Vm {
    let mut vm = Vm::with_config(args.vm_config());
    vm.set_compiler_config(args.compiler_config());
    if args.paths.is_empty() {
        vm.add_path(default_dir);
    }
    for dir in &args.paths {
        vm.add_path(dir);
    }
    debug!(paths = args.paths.len(), "interpreter ready");
    vm
}

// ── Listing ───────────────────────────────────────────────────────────────────

fn list(path: &Path, config: CompilerConfig) -> Result<()> {
    if path.is_dir() {
        bail!("cannot list a directory: {}", path.display());
    }
    let src = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let name = path.display().to_string();
    let proto = lunar_compiler::compile_with(&src, &name, config)
        .map_err(|error| vm_error(Error::Static { chunk: name, error }))?;
    print!("{}", lunar_compiler::disassemble(&proto));
    Ok(())
}

// ── Interactive prompt ────────────────────────────────────────────────────────

/// Input that may become valid once more lines arrive.
fn is_incomplete(err: &Error) -> bool {
    matches!(
        err,
        Error::Static {
            error: LuaError::Syntax { near, .. } | LuaError::Lex { near, .. },
            ..
        } if near == "<eof>"
    )
}

/// `local x = ...` at the prompt becomes a global so it outlives the line.
/// Declarations carrying `<const>` or `<close>` stay local, since the
/// attribute has no global spelling.
fn hoist_local(src: &str) -> String {
    let Some(rest) = src.trim_start().strip_prefix("local ") else {
        return src.to_string();
    };
    let rest = rest.trim_start();
    let names = rest.split('=').next().unwrap_or(rest);
    if !rest.starts_with("function") && names.contains('<') {
        return src.to_string();
    }
    rest.to_string()
}

fn print_results(vm: &mut Vm, values: &[lunar_vm::Value]) -> Result<(), Error> {
    if values.is_empty() {
        return Ok(());
    }
    let mut parts = Vec::with_capacity(values.len());
    for v in values {
        parts.push(vm.tostring(v)?.to_string());
    }
    println!("{}", parts.join("\t"));
    Ok(())
}

fn repl(vm: &mut Vm) -> Result<()> {
    println!("lunar {}  (type 'exit' or Ctrl-D to quit)", env!("CARGO_PKG_VERSION"));
    let mut rl = DefaultEditor::new().context("cannot initialise line editor")?;
    let mut buf = String::new();

    loop {
        let prompt = if buf.is_empty() { "> " } else { ">> " };
        let line = match rl.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                buf.clear();
                continue;
            }
            Err(ReadlineError::Eof) => {
                if !buf.is_empty() {
                    eprintln!("<incomplete input>");
                }
                println!();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if buf.is_empty() {
            if line.trim() == "exit" {
                return Ok(());
            }
            if !line.trim().is_empty() {
                let _ = rl.add_history_entry(line.as_str());
            }
        } else {
            buf.push('\n');
        }
        buf.push_str(&line);

        // An expression prints its values; otherwise run it as statements.
        let chunk = match vm.load(&format!("return {buf}"), "stdin") {
            Ok(f) => f,
            Err(_) => match vm.load(&hoist_local(&buf), "stdin") {
                Ok(f) => f,
                Err(err) if is_incomplete(&err) => continue,
                Err(err) => {
                    eprintln!("{err}");
                    buf.clear();
                    continue;
                }
            },
        };
        buf.clear();
        let outcome = vm
            .call(chunk, Vec::new())
            .and_then(|values| print_results(vm, &values));
        if let Err(err) = outcome {
            eprintln!("{err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_input_is_detected() {
        let mut vm = Vm::new();
        let err = vm.load("for i = 1, 3 do", "stdin").unwrap_err();
        assert!(is_incomplete(&err));
        let err = vm.load("x = = 1", "stdin").unwrap_err();
        assert!(!is_incomplete(&err));
    }

    #[test]
    fn locals_are_hoisted_to_globals() {
        assert_eq!(hoist_local("local x = 1"), "x = 1");
        assert_eq!(hoist_local("local function f() end"), "function f() end");
        assert_eq!(hoist_local("print(1)"), "print(1)");
        assert_eq!(hoist_local("local a, b = x < y, 2"), "a, b = x < y, 2");
    }

    #[test]
    fn attributed_locals_stay_local() {
        assert_eq!(hoist_local("local x <const> = 1"), "local x <const> = 1");
        assert_eq!(hoist_local("local a, f <close> = 1, nil"), "local a, f <close> = 1, nil");
        assert_eq!(
            hoist_local("local function lt(a, b) return a < b end"),
            "function lt(a, b) return a < b end"
        );

        let mut vm = Vm::new();
        let chunk = vm.load(&hoist_local("local x <const> = 1"), "stdin").unwrap();
        vm.call(chunk, Vec::new()).unwrap();
    }

    #[test]
    fn arguments_parse() {
        let args = Args::parse_from(["lunar", "-I", "lib", "--path", "vendor", "--no-fold", "main.lua"]);
        assert_eq!(args.paths, vec![PathBuf::from("lib"), PathBuf::from("vendor")]);
        assert_eq!(args.path, Some(PathBuf::from("main.lua")));
        assert!(!args.compiler_config().fold_constants);
        assert_eq!(args.vm_config(), VmConfig::default());
    }
}
