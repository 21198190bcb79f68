// File: src/main.rs
//
// Command-line driver for Lume. Dispatches to the script runner, the
// REPL, or the disassembler. Exit codes follow convention: 65 for
// compile errors, 70 for runtime errors.

use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use lume::compiler;
use lume::debug;
use lume::heap::Heap;
use lume::repl::Repl;
use lume::vm::Vm;

#[derive(Parser)]
#[command(
    name = "lume",
    about = "Lume: a small class-based scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a Lume script file
    Run {
        /// Path to the .lume file
        file: PathBuf,
    },

    /// Launch the interactive Lume shell
    Repl,

    /// Compile a script and print its bytecode
    Disasm {
        /// Path to the .lume file
        file: PathBuf,
    },
}

fn read_source(file: &PathBuf) -> String {
    match fs::read_to_string(file) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not read {}: {}", file.display(), error);
            std::process::exit(74);
        }
    }
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file } => {
            let source = read_source(&file);
            let mut vm = Vm::new();
            if let Err(error) = vm.interpret(&source) {
                eprint!("{}", error);
                std::process::exit(error.exit_code());
            }
        }

        Commands::Repl => match Repl::new() {
            Ok(mut repl) => {
                if let Err(error) = repl.run() {
                    eprintln!("REPL error: {}", error);
                    std::process::exit(1);
                }
            }
            Err(error) => {
                eprintln!("Failed to start REPL: {}", error);
                std::process::exit(1);
            }
        },

        Commands::Disasm { file } => {
            let source = read_source(&file);
            let mut heap = Heap::new();
            match compiler::compile(&source, &mut heap) {
                Ok(function) => debug::disassemble_function(&heap, function),
                Err(diagnostics) => {
                    for diagnostic in diagnostics {
                        eprintln!("{}", diagnostic);
                    }
                    std::process::exit(65);
                }
            }
        }
    }
}
