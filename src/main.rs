//! taskpulse CLI - task-scheduler telemetry pipeline

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use taskpulse::config::TelemetryConfig;
use taskpulse::consumer::{ConsumeReport, EventConsumer};
use taskpulse::error::{FixSuggestion, TelemetryError};
use taskpulse::init::init_deployment;
use taskpulse::logging::{init_tracing, LogContext};
use taskpulse::sim::{run_simulation, SimulationOptions};
use taskpulse::transport::{self, StartPosition};

#[derive(Parser)]
#[command(name = "taskpulse")]
#[command(about = "taskpulse - task-scheduler telemetry pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write taskpulse.yaml and a group descriptor
    Init {
        /// Deployment directory
        #[arg(default_value = ".")]
        dir: PathBuf,
    },

    /// Consume the topic until a terminal event, then export tables
    ///
    /// The topic is replayed from its first event, so a reused deployment
    /// stops at the earliest session's end. Use --from-end to only read events
    /// published after the consumer starts.
    Consume {
        #[command(flatten)]
        common: CommonArgs,

        /// Skip events already on the topic
        #[arg(long)]
        from_end: bool,
    },

    /// Drive a simulated scheduler and workers through one graph
    Simulate {
        #[command(flatten)]
        common: CommonArgs,

        /// Number of simulated workers
        #[arg(long, default_value_t = 2)]
        workers: usize,

        /// Number of chunks in the simulated graph
        #[arg(long, default_value_t = 4)]
        tasks: usize,

        /// Client id submitting the graph
        #[arg(long, default_value = "Client-sim")]
        client: String,

        /// Also run a consumer in this process
        #[arg(long)]
        consume: bool,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Config file (defaults to ./taskpulse.yaml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transport protocol (local, memory)
    #[arg(short, long)]
    protocol: Option<String>,

    /// Group descriptor path
    #[arg(short, long)]
    group_file: Option<PathBuf>,

    /// Topic name
    #[arg(short, long)]
    topic: Option<String>,

    /// Directory for exported tables
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
}

impl CommonArgs {
    fn load(self) -> Result<TelemetryConfig, TelemetryError> {
        let mut config = TelemetryConfig::load_or_default(self.config.as_deref())?;
        if let Some(p) = self.protocol {
            config.transport.protocol = p;
        }
        if let Some(g) = self.group_file {
            config.transport.group_file = g;
        }
        if let Some(t) = self.topic {
            config.topic = t;
        }
        if let Some(o) = self.output_dir {
            config.output_dir = o;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { dir } => init(&dir),
        Commands::Consume { common, from_end } => consume(common, from_end).await,
        Commands::Simulate {
            common,
            workers,
            tasks,
            client,
            consume,
        } => {
            let options = SimulationOptions {
                workers,
                tasks,
                client,
            };
            simulate(common, options, consume).await
        }
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        if let Some(suggestion) = e
            .downcast_ref::<TelemetryError>()
            .and_then(|t| t.fix_suggestion())
        {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn init(dir: &Path) -> anyhow::Result<()> {
    let result = init_deployment(dir)?;
    println!(
        "{} Initialized group '{}' in {}",
        "✓".green(),
        result.group.cyan().bold(),
        result.deployment_dir
    );
    for file in &result.files_created {
        println!("  {}", file);
    }
    Ok(())
}

fn start_logging(config: &TelemetryConfig) -> anyhow::Result<()> {
    init_tracing(config.log_file.as_deref()).context("cannot open log file")
}

async fn consume(common: CommonArgs, from_end: bool) -> anyhow::Result<()> {
    let config = common.load()?;
    start_logging(&config)?;

    let start = if from_end {
        StartPosition::End
    } else {
        StartPosition::Beginning
    };
    println!(
        "{} Consuming topic {} over {}",
        "→".cyan(),
        config.topic.cyan().bold(),
        config.transport.protocol.cyan()
    );
    if !from_end {
        eprintln!(
            "{} replaying the topic from its first event; pass --from-end to skip earlier sessions",
            "Note:".yellow()
        );
    }

    let report = tokio::task::spawn_blocking(move || {
        let consumer = EventConsumer::connect_at(
            &config.transport,
            &config.topic,
            start,
            LogContext::new("consumer"),
        )?;
        consumer.run(&config.output_dir)
    })
    .await??;

    print_report(&report);
    Ok(())
}

async fn simulate(
    common: CommonArgs,
    options: SimulationOptions,
    consume: bool,
) -> anyhow::Result<()> {
    let config = common.load()?;
    start_logging(&config)?;

    let service = transport::connect(&config.transport)?;
    if config.transport.protocol == "memory" && !consume {
        eprintln!(
            "{} memory transport without --consume: events are discarded on exit",
            "Warning:".yellow()
        );
    }

    let consumer = if consume {
        let consumer = EventConsumer::with_service(
            Arc::clone(&service),
            &config.topic,
            LogContext::new("consumer"),
        )?;
        let output_dir = config.output_dir.clone();
        Some(tokio::task::spawn_blocking(move || consumer.run(&output_dir)))
    } else {
        None
    };

    let topic = config.topic.clone();
    let report = tokio::task::spawn_blocking(move || {
        run_simulation(service, &topic, &options, &LogContext::new("sim"))
    })
    .await??;

    println!(
        "{} Simulated {} keys on {} workers ({} transfers)",
        "✓".green(),
        report.keys,
        report.workers,
        report.transfers
    );

    if let Some(handle) = consumer {
        print_report(&handle.await??);
    }
    Ok(())
}

fn print_report(report: &ConsumeReport) {
    println!(
        "{} Consumed {} events ({} dropped)",
        "✓".green(),
        report.decoded,
        report.dropped
    );
    for (table, rows) in &report.rows {
        println!("  {:<22} {}", table.as_str(), rows);
    }
    for path in &report.files {
        println!("  {} {}", "→".cyan(), path.display());
    }
}
