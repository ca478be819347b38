//! MiniLAX compiler CLI.
//!
//! One invocation compiles one source file to a CBAM listing. `-d` dumps
//! the intermediate stages to stdout, `-O` enables the TAC optimizer, `-R`
//! drops the array range checks.

use clap::{CommandFactory, Parser as ClapParser};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;
use std::process;
use tracing::Level;

#[derive(ClapParser)]
#[command(name = "mlaxc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MiniLAX compiler - compile MiniLAX programs to CBAM listings", long_about = None)]
struct Cli {
    /// Input MiniLAX source file
    input: Option<PathBuf>,

    /// Output listing path
    #[arg(short, long, default_value = "a.cbam")]
    output: PathBuf,

    /// Show verbose messages during compilation
    #[arg(short, long)]
    verbose: bool,

    /// Show debug information and intermediate stages during compilation
    #[arg(short, long)]
    debug: bool,

    /// Code improvement (optimization)
    #[arg(short = 'O', long)]
    optimize: bool,

    /// Disable range checking
    #[arg(short = 'R', long = "no-range-checks")]
    no_range_checks: bool,

    /// Force use of the stack code generation scheme
    #[arg(short = 'S', long = "stack-scheme")]
    stack_scheme: bool,

    /// Force use of the three-address code generation scheme (the default)
    #[arg(short = 'N', long = "new-codegen")]
    new_codegen: bool,

    /// Generate shell completion scripts and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,
}

fn main() {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "mlaxc", &mut io::stdout());
        return;
    }

    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .init();

    let input = match cli.input {
        Some(input) => input,
        None => {
            eprintln!("Error: no input file given");
            process::exit(2);
        }
    };

    if cli.stack_scheme && !cli.new_codegen {
        eprintln!("Error: the stack code generation scheme is not available in this build");
        process::exit(2);
    }

    let opts = mlaxc::Options {
        verbose: cli.verbose,
        debug: cli.debug,
        optimize: cli.optimize,
        range_checks: !cli.no_range_checks,
    };

    match mlaxc::compile_file(&input, &cli.output, opts) {
        Ok(()) => {
            println!("Compiled {} -> {}", input.display(), cli.output.display());
        }
        Err(error) => {
            eprintln!("Error: {}", error);
            process::exit(1);
        }
    }
}
