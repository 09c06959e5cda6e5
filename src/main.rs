use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use string_array_deob::{DeobConfig, DeobError, Diagnostic, Pipeline, RunStats};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "string-array-deob")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Recovers string literals from string-array obfuscated JavaScript.",
    long_about = None
)]
#[command(after_help = "# Examples:\n\n\
    ## Print the deobfuscated script:\n\
    string-array-deob obfuscated.js\n\n\
    ## Write it to a file and report diagnostics as JSON:\n\
    string-array-deob obfuscated.js -o clean.js --report json")]
struct Cli {
    /// Obfuscated script to read
    input: PathBuf,

    /// Write the result here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Format of the diagnostics written to stderr
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    report: ReportFormat,

    /// Log stage details (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("Failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("Failed to write output: {0}")]
    Stdout(#[source] io::Error),
    #[error(transparent)]
    Deob(#[from] DeobError),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            CliError::Deob(DeobError::Parse { .. }) => 1,
            _ => 2,
        }
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    diagnostics: &'a [Diagnostic],
    stats: RunStats,
}

impl Cli {
    fn run(&self) -> Result<(), CliError> {
        let config = match &self.config {
            Some(path) => {
                let json = fs::read_to_string(path).map_err(|source| CliError::Read {
                    path: path.clone(),
                    source,
                })?;
                DeobConfig::from_json(&json).map_err(DeobError::from)?
            }
            None => DeobConfig::default(),
        };
        let source = fs::read_to_string(&self.input).map_err(|source| CliError::Read {
            path: self.input.clone(),
            source,
        })?;

        let name = self.input.display().to_string();
        let out = Pipeline::new(config)?.run(&name, &source)?;
        debug!(stats = ?out.stats, "run stats");

        match &self.output {
            Some(path) => fs::write(path, &out.code).map_err(|source| CliError::Write {
                path: path.clone(),
                source,
            })?,
            None => {
                let mut stdout = io::stdout().lock();
                stdout
                    .write_all(out.code.as_bytes())
                    .and_then(|_| stdout.flush())
                    .map_err(CliError::Stdout)?;
            }
        }

        self.report(&out.diagnostics, out.stats);
        Ok(())
    }

    fn report(&self, diagnostics: &[Diagnostic], stats: RunStats) {
        match self.report {
            ReportFormat::Text => {
                for diagnostic in diagnostics {
                    eprintln!("{diagnostic}");
                }
            }
            ReportFormat::Json => {
                let report = JsonReport { diagnostics, stats };
                match serde_json::to_string(&report) {
                    Ok(json) => eprintln!("{json}"),
                    Err(e) => eprintln!("Failed to serialize diagnostics: {e}"),
                }
            }
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("string_array_deob=debug"),
        _ => EnvFilter::new("string_array_deob=trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
