//! omc CLI
//!
//! Command-line interface for compiling omc source files to bytecode images.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;
use std::process;

use omc::CompileErrorOrIo;

#[derive(ClapParser)]
#[command(name = "omc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "omc compiler - compile omc source files to bytecode images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source file to a bytecode image
    Compile {
        /// Input source file
        input: PathBuf,

        /// Output image path
        output: PathBuf,
    },

    /// Parse and analyze a source file without producing an output file
    Check {
        /// Input source file
        input: PathBuf,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compile { input, output } => run_compile(&input, &output),
        Commands::Check { input } => run_check(&input),
        Commands::Completions { shell } => run_completions(shell),
    }
}

fn run_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "omc", &mut io::stdout());
}

fn run_compile(input: &std::path::Path, output: &std::path::Path) {
    match omc::compile_file(input, output) {
        Ok(()) => {
            tracing::info!(input = %input.display(), output = %output.display(), "compiled");
        }
        Err(e) => report_and_exit(e),
    }
}

fn run_check(input: &std::path::Path) {
    match omc::check_file(input) {
        Ok(()) => {
            tracing::info!(input = %input.display(), "no errors");
        }
        Err(e) => report_and_exit(e),
    }
}

fn report_and_exit(err: CompileErrorOrIo) -> ! {
    match err {
        CompileErrorOrIo::Compile(e) => {
            eprintln!("{} at {}", kind_name(&e), e.position());
        }
        CompileErrorOrIo::Io(e) => {
            eprintln!("{}", e);
        }
    }
    process::exit(1);
}

/// The bare variant name, for the `<kind> at (<line>,<col>)` stderr line;
/// `CompileError`'s own `Display` includes the position already, which
/// would double it up here.
fn kind_name(err: &omc::CompileError) -> &'static str {
    use omc::CompileError::*;
    match err {
        InvalidInput(_) => "InvalidInput",
        ExpectedToken { .. } => "ExpectedToken",
        NotDeclared(_) => "NotDeclared",
        DuplicateDeclaration(_) => "DuplicateDeclaration",
        AssignToConstant(_) => "AssignToConstant",
        InvalidAssignment(_) => "InvalidAssignment",
        TypeError(_) => "TypeError",
        NotValidReturn(_) => "NotValidReturn",
        ParamError(_) => "ParamError",
        NotWhile(_) => "NotWhile",
        NoMain(_) => "NoMain",
    }
}
