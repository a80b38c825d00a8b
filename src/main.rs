use anyhow::Result;
use clap::{Parser, Subcommand};
use int_report_bench::config::TopologyConfig;
use int_report_bench::logging;
use int_report_bench::output::write_json;
use int_report_bench::roles::consumer::{ConsumerConfig, run_consumer};
use int_report_bench::roles::producer::{ProducerConfig, example_routes, run_producer};
use int_report_bench::topology::{Topology, run_benchmark};
use int_report_bench::transport::config::{parse_connect_kv, parse_engine};
use int_report_bench::transport::{Transport, TransportBuilder};
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "int-report-bench")]
#[command(about = "Synthetic INT telemetry report generator and consumer")]
struct Cli {
    /// Log level or tracing filter directive
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Transport engine (mock, kafka)
    #[arg(long, default_value = "mock")]
    engine: String,

    /// Kafka bootstrap servers
    #[arg(long, default_value = "localhost:9092")]
    bootstrap_server: String,

    /// Extra transport properties as key=value (repeatable)
    #[arg(long = "connect")]
    connect: Vec<String>,

    /// Output directory for artifacts; relative file arguments land here
    #[arg(long, default_value = "./artifacts")]
    out_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Throughput benchmark: one worker per flow of a static topology
    Bench {
        /// Reports per flow
        #[arg(long, default_value = "1000000")]
        pkts_per_flow: u64,

        /// YAML topology file (built-in benchmark topology if omitted)
        #[arg(long)]
        topology: Option<String>,

        /// Final flush timeout (ms)
        #[arg(long, default_value = "10000")]
        flush_timeout_ms: u64,

        /// Write the run summary as JSON
        #[arg(long)]
        summary_json: Option<String>,
    },
    /// Random SCION reports over the example routes
    Produce {
        /// Number of reports to send
        #[arg(long, default_value = "1000")]
        events: u64,

        /// Number of distinct flows
        #[arg(long, default_value = "1")]
        flows: u32,

        /// Reports per second. If omitted or <= 0, runs at max speed
        #[arg(long, allow_hyphen_values = true)]
        rate: Option<f64>,

        /// Final flush timeout (ms)
        #[arg(long, default_value = "1000")]
        flush_timeout_ms: u64,

        /// RNG seed for reproducible flow ids and routes
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Decode and print reports
    Consume {
        /// Topics to subscribe to (the example routes' topics if omitted)
        #[arg(long = "topic")]
        topics: Vec<String>,

        #[arg(long, default_value = "ConsumerGroup1")]
        group_id: String,

        /// Stop after this many decoded reports
        #[arg(long)]
        max_messages: Option<u64>,

        /// Optional CSV output file path (stdout if omitted)
        #[arg(long)]
        csv: Option<String>,

        /// Snapshot interval in seconds for periodic stats output (0 disables)
        #[arg(long, default_value = "1")]
        snapshot_interval: u64,

        /// Only print statistics, not every report
        #[arg(long)]
        quiet: bool,
    },
}

fn artifact_path(out_dir: &str, name: &str) -> String {
    Path::new(out_dir).join(name).to_string_lossy().into_owned()
}

async fn connect(cli: &Cli) -> Result<Box<dyn Transport>> {
    let engine = parse_engine(&cli.engine)
        .ok_or_else(|| anyhow::Error::msg(format!("unknown engine: {}", cli.engine)))?;
    let opts = parse_connect_kv(&cli.bootstrap_server, &cli.connect);
    TransportBuilder::connect(engine, opts)
        .await
        .map_err(|e| anyhow::Error::msg(format!("transport connect error: {}", e)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level)?;

    let transport = connect(&cli).await?;
    transport
        .health_check()
        .await
        .map_err(|e| anyhow::Error::msg(format!("transport health check failed: {}", e)))?;
    info!(engine = %cli.engine, "transport connected");

    match &cli.command {
        Commands::Bench {
            pkts_per_flow,
            topology,
            flush_timeout_ms,
            summary_json,
        } => {
            let cfg = match topology {
                Some(path) => TopologyConfig::load(path)?,
                None => TopologyConfig::benchmark_default(),
            };
            let topology = Topology::from_config(&cfg)?;
            let summary = run_benchmark(
                &topology,
                transport.as_ref(),
                *pkts_per_flow,
                Duration::from_millis(*flush_timeout_ms),
            )
            .await?;
            println!("{}", summary.lines());
            if let Some(name) = summary_json {
                let path = artifact_path(&cli.out_dir, name);
                write_json(&path, &summary).await?;
                info!(path = %path, "wrote bench summary");
            }
        }
        Commands::Produce {
            events,
            flows,
            rate,
            flush_timeout_ms,
            seed,
        } => {
            let cfg = ProducerConfig {
                events: *events,
                flows: *flows,
                rate: *rate,
                flush_timeout: Duration::from_millis(*flush_timeout_ms),
                seed: *seed,
                ..ProducerConfig::default()
            };
            let summary = run_producer(cfg, transport.as_ref()).await?;
            println!(
                "Enqueued {} reports: {} delivered, {} failed, {} undelivered after flush.",
                summary.enqueued, summary.delivered, summary.delivery_failures, summary.undelivered
            );
        }
        Commands::Consume {
            topics,
            group_id,
            max_messages,
            csv,
            snapshot_interval,
            quiet,
        } => {
            let topics = if topics.is_empty() {
                example_routes().into_iter().map(|r| r.topic).collect()
            } else {
                topics.clone()
            };
            let cfg = ConsumerConfig {
                topics,
                group_id: group_id.clone(),
                max_messages: *max_messages,
                output_file: csv.as_ref().map(|name| artifact_path(&cli.out_dir, name)),
                snapshot_interval_secs: *snapshot_interval,
                print_reports: !quiet,
            };
            run_consumer(cfg, transport.as_ref()).await?;
        }
    }

    transport
        .shutdown()
        .await
        .map_err(|e| anyhow::Error::msg(format!("transport shutdown error: {}", e)))?;
    Ok(())
}
