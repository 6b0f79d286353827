//! Nova command-line driver
//!
//! Thin consumer of the embedding API: read a script, create a state,
//! register the built-in library, compile, run under a protected call.

use anyhow::Context;
use clap::Parser;
use nova_runtime::{stdlib, State};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Exit code for a compile error (sysexits EX_DATAERR)
const EXIT_COMPILE: u8 = 65;
/// Exit code for a runtime error (sysexits EX_SOFTWARE)
const EXIT_RUNTIME: u8 = 70;

#[derive(Parser)]
#[command(name = "nova", version, about = "The Nova scripting language")]
struct Args {
    /// Script file to run
    script: PathBuf,

    /// Print the compiled bytecode instead of running
    #[arg(long)]
    disasm: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("nova: {:#}", error);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<ExitCode> {
    let source = std::fs::read_to_string(&args.script)
        .with_context(|| format!("cannot read '{}'", args.script.display()))?;
    let module = args
        .script
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string());

    let mut state = State::new();
    stdlib::open(&mut state).context("registering the built-in library")?;

    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    if let Err(diagnostics) = state.compile_string(&source, &module) {
        for diagnostic in &diagnostics {
            diagnostic.emit(&mut stderr)?;
        }
        return Ok(ExitCode::from(EXIT_COMPILE));
    }

    if args.disasm {
        let listing = state
            .disassemble(0)
            .context("no compiled chunk to disassemble")?;
        print!("{}", listing);
        return Ok(ExitCode::SUCCESS);
    }

    if let Err(error) = state.pcall(0, 0) {
        stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true))?;
        write!(stderr, "error")?;
        stderr.reset()?;
        writeln!(stderr, ": {}", error)?;
        return Ok(ExitCode::from(EXIT_RUNTIME));
    }

    Ok(ExitCode::SUCCESS)
}
