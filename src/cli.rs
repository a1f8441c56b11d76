//! Command-line interface for the sysvm engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sysvm")]
#[command(about = "Compile and run WebAssembly contracts in the sysvm sandbox", long_about = None)]
pub struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute an exported function in a fresh context
    Run {
        /// Module to run, binary (.wasm) or text (.wat)
        module: PathBuf,

        /// Name of the exported function to call
        #[arg(long)]
        invoke: String,

        /// Argument for the function, parsed by the parameter's type
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Resource budget granted to the execution
        #[arg(long, default_value_t = 10_000_000)]
        budget: u64,
    },

    /// Compile a module and print the artifact summary
    Compile {
        /// Module to compile, binary (.wasm) or text (.wat)
        module: PathBuf,
    },
}
