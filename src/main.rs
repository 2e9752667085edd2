use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use hrm_qm::config::{DispatchConfig, InFlightPolicy, MalformedPolicy, QmConfig};
use hrm_qm::engine::{check_resource_dirs, Engine, LocalEngine};
use hrm_qm::manager::{QueueManager, RunSummary};
use hrm_qm::shutdown::install_shutdown_handler;
use hrm_qm::spool::{JobSpooler, SpoolDir};

#[derive(Parser, Debug)]
#[command(name = "hrm-qm")]
#[command(version)]
#[command(about = "Spool-directory job queue manager for HuCore")]
struct Args {
    /// Spool directory holding new/, cur/, done/ and error/
    #[arg(long, short = 's')]
    spooldir: PathBuf,

    /// Engine configuration file [default: <spooldir>/engine.toml]
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Run jobs on this engine resource only
    #[arg(long, short = 'r')]
    resource: Option<String>,

    /// Write a JSON snapshot of the queues to this file on every change
    #[arg(long, short = 'q')]
    queuelist: Option<PathBuf>,

    /// Additional job type to accept and dispatch (repeatable)
    #[arg(long = "queue-type", short = 't')]
    queue_types: Vec<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Delay between engine polls and between queue checks
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,

    /// Kill a job and mark it failed after this many seconds
    #[arg(long)]
    max_wait_secs: Option<u64>,

    /// What to do with job files that cannot be parsed
    #[arg(long, default_value = "quarantine")]
    malformed: MalformedArg,

    /// What to do with a running job on shutdown
    #[arg(long, default_value = "finish")]
    in_flight: InFlightArg,

    /// Do not re-queue job files left in cur/ by a previous run
    #[arg(long)]
    no_recover: bool,

    /// Format of the shutdown summary
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MalformedArg {
    Leave,
    Quarantine,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum InFlightArg {
    Finish,
    Abandon,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

impl From<MalformedArg> for MalformedPolicy {
    fn from(arg: MalformedArg) -> Self {
        match arg {
            MalformedArg::Leave => MalformedPolicy::Leave,
            MalformedArg::Quarantine => MalformedPolicy::Quarantine,
        }
    }
}

impl From<InFlightArg> for InFlightPolicy {
    fn from(arg: InFlightArg) -> Self {
        match arg {
            InFlightArg::Finish => InFlightPolicy::Finish,
            InFlightArg::Abandon => InFlightPolicy::Abandon,
        }
    }
}

impl Args {
    fn to_config(&self) -> QmConfig {
        let mut dispatch = DispatchConfig::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms.max(1)))
            .with_in_flight(self.in_flight.into());
        if let Some(secs) = self.max_wait_secs {
            dispatch = dispatch.with_max_wait(Duration::from_secs(secs));
        }

        let mut config = QmConfig::new(&self.spooldir)
            .with_malformed(self.malformed.into())
            .with_dispatch(dispatch);
        for job_type in &self.queue_types {
            config = config.with_queue_type(job_type);
        }
        if let Some(path) = &self.config {
            config = config.with_engine_config(path);
        }
        config.resource = self.resource.clone();
        config.queuelist = self.queuelist.clone();
        config.recover_claimed = !self.no_recover;
        config
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);
    let config = args.to_config();

    let spooler = match JobSpooler::new(&config.spool_dir, config.engine_config.clone()) {
        Ok(spooler) => spooler,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut engine = match LocalEngine::from_config_file(spooler.engine_config()).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(resource) = &config.resource {
        if let Err(e) = engine.select_resource(resource) {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if let Err(unclean) = check_resource_dirs(&engine.list_resources()) {
        for resource in &unclean {
            eprintln!(
                "Resource '{}' has leftovers in {}: {}",
                resource.name,
                resource.resource_dir.display(),
                resource.entries.join(", ")
            );
        }
        eprintln!("Refusing to start, clean your resource dir first!");
        return ExitCode::from(2);
    }

    let shutdown = install_shutdown_handler();
    println!(
        "Queue manager started, watching {} (Ctrl-C to stop)",
        spooler.dir(SpoolDir::New).display()
    );

    let output = args.output;
    let manager = QueueManager::new(config, spooler, engine);
    match manager.run(shutdown).await {
        Ok(summary) => {
            print_summary(&summary, output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_summary(summary: &RunSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(summary) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error: {}", e),
        },
        OutputFormat::Table => {
            println!("{:<12} {:>6}", "OUTCOME", "JOBS");
            println!("{}", "-".repeat(19));
            println!("{:<12} {:>6}", "succeeded", summary.report.succeeded);
            println!("{:<12} {:>6}", "failed", summary.report.failed);
            println!("{:<12} {:>6}", "abandoned", summary.report.abandoned);
            if !summary.remaining.is_empty() {
                println!();
                println!("Still queued: {}", summary.remaining.join(", "));
            }
        }
    }
}
