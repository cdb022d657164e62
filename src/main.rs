// File: src/main.rs
//
// Command-line entry point: `run`/`eval`/`disasm`/`repl` subcommands over the
// library's `Host` facade. Grounded on `rufflang-ruff/src/main.rs` for the clap
// `Cli`/`Commands` shape and error-printing convention; the JIT/benchmark/profile
// subcommands and the tokio runtime are dropped since nothing in this crate is
// async (see DESIGN.md's dropped-dependencies list).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;

use skiff::host::Host;
use skiff::repl::Repl;

#[derive(Parser)]
#[command(name = "skiff", version, about = "The Skiff scripting language")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file.
    Run {
        file: PathBuf,
    },
    /// Evaluate a single expression and print its value.
    Eval {
        expr: String,
    },
    /// Print the compiled bytecode for a script file.
    Disasm {
        file: PathBuf,
    },
    /// Start an interactive REPL.
    Repl,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Run { file }) => run_file(&file),
        Some(Commands::Eval { expr }) => eval_expr(&expr),
        Some(Commands::Disasm { file }) => disasm_file(&file),
        Some(Commands::Repl) | None => run_repl(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{} {msg}", "error:".bright_red().bold());
            ExitCode::FAILURE
        }
    }
}

fn read_source(file: &PathBuf) -> Result<String, String> {
    std::fs::read_to_string(file).map_err(|e| format!("couldn't read {}: {e}", file.display()))
}

fn run_file(file: &PathBuf) -> Result<(), String> {
    let source = read_source(file)?;
    let mut host = Host::new();
    host.run(&source).map_err(|e| e.to_string())?;
    Ok(())
}

fn eval_expr(expr: &str) -> Result<(), String> {
    let mut host = Host::new();
    let value = host.eval(expr).map_err(|e| e.to_string())?;
    println!("{}", host.describe(&value));
    Ok(())
}

fn disasm_file(file: &PathBuf) -> Result<(), String> {
    let source = read_source(file)?;
    let proto = skiff::compiler::Compiler::compile_script(&source).map_err(|e| e.to_string())?;
    print!("{}", skiff::bytecode::disassemble(&proto));
    Ok(())
}

fn run_repl() -> Result<(), String> {
    let mut repl = Repl::new().map_err(|e| e.to_string())?;
    repl.run().map_err(|e| e.to_string())
}
