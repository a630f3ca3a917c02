use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use template_converge::Result;
use template_converge::executor::{self, ExecSink, NullSink, StdoutSink};
use template_converge::runfile::RunFile;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Diagnostic log format (stderr); level comes from RUST_LOG
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Converge every template resource in a run file
    Run {
        /// Path to a run file TOML
        file: PathBuf,
        /// Report what would change without touching any file
        #[arg(long)]
        dry_run: bool,
        /// Max number of target paths to converge concurrently (0 = use CPU count)
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Print per-resource outcomes as JSON instead of progress lines
        #[arg(long)]
        json: bool,
    },
    /// Print the template each resource would render
    Locate {
        /// Path to a run file TOML
        file: PathBuf,
    },
    /// Load a run file and print the fully-resolved TOML (after imports/extends)
    Resolve {
        /// Path to a run file TOML
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_format);
    let res = match args.cmd {
        Command::Run {
            file,
            dry_run,
            max_parallel,
            json,
        } => cmd_run(&file, dry_run, max_parallel, json),
        Command::Locate { file } => cmd_locate(&file),
        Command::Resolve { file } => cmd_resolve(&file),
    };
    match res {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn cmd_run(path: &PathBuf, dry_run: bool, max_parallel: Option<usize>, json: bool) -> Result<bool> {
    let run = RunFile::load(path.as_path())?;
    let converger = run.converger(dry_run);
    let max_parallel = run.max_parallel(max_parallel);

    let stdout_sink = StdoutSink::default();
    let sink: &dyn ExecSink = if json { &NullSink } else { &stdout_sink };
    let report = if max_parallel <= 1 {
        executor::execute_run(&converger, &run.resources, sink)
    } else {
        executor::execute_run_parallel(&converger, &run.resources, sink, max_parallel)
    };

    if json {
        let s = serde_json::to_string_pretty(&report)
            .map_err(|e| template_converge::Error::msg(format!("failed to encode report: {e}")))?;
        println!("{s}");
    }
    Ok(report.ok())
}

fn cmd_locate(path: &PathBuf) -> Result<bool> {
    let run = RunFile::load(path.as_path())?;
    let mut ok = true;
    for (i, (desired, located)) in run.locate_all().into_iter().enumerate() {
        match located {
            Ok(src) => println!(
                "{:>2}. {}  <=  {}",
                i + 1,
                desired.target_path.display(),
                src.display()
            ),
            Err(e) => {
                ok = false;
                println!(
                    "{:>2}. {}  <=  [{}] {e}",
                    i + 1,
                    desired.target_path.display(),
                    e.kind()
                );
            }
        }
    }
    Ok(ok)
}

fn cmd_resolve(path: &PathBuf) -> Result<bool> {
    let run = template_converge::config::load(path.as_path())?;
    // Merged run file after extends/imports; fall back to Debug if it cannot be re-encoded.
    match toml::to_string_pretty(&run.value) {
        Ok(merged) => print!("{merged}"),
        Err(e) => {
            tracing::warn!("cannot re-encode merged run file as TOML: {e}");
            println!("{:#?}", run.value);
        }
    }
    Ok(true)
}
