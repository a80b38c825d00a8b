use crate::clock::{Clock, SystemClock};
use crate::metrics::stats::{Stats, StatsSnapshot};
use crate::output::OutputWriter;
use crate::report::{FlowKey, MetadataType, Report, ReportError};
use crate::transport::{Delivery, Subscriber, Transport, TransportError};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{info, warn};

/// Pause after a transport read error before reading again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(500);

pub struct ConsumerConfig {
    pub topics: Vec<String>,
    pub group_id: String,
    /// Stop after this many decoded reports; `None` runs until Ctrl+C.
    pub max_messages: Option<u64>,
    pub output_file: Option<String>,
    pub snapshot_interval_secs: u64,
    /// Print every decoded report to stdout.
    pub print_reports: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ConsumeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("message on {topic} has no key")]
    MissingKey { topic: String },
    #[error("flow key on {topic}: {source}")]
    Key {
        topic: String,
        #[source]
        source: ReportError,
    },
    #[error("report on {topic}: {source}")]
    Report {
        topic: String,
        #[source]
        source: ReportError,
    },
}

impl ConsumeError {
    pub fn is_decode(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedReport {
    pub topic: String,
    pub partition: i32,
    pub key: FlowKey,
    pub report: Report,
}

/// Decodes the key as a flow key and the value as a report. Unknown tags and
/// unexpected widths are kept so they can be rendered.
pub fn decode_delivery(d: &Delivery) -> Result<DecodedReport, ConsumeError> {
    let raw_key = d.key.as_ref().ok_or_else(|| ConsumeError::MissingKey {
        topic: d.topic.clone(),
    })?;
    let key = FlowKey::unmarshal(raw_key).map_err(|source| ConsumeError::Key {
        topic: d.topic.clone(),
        source,
    })?;
    let report = Report::unmarshal(&d.value).map_err(|source| ConsumeError::Report {
            topic: d.topic.clone(),
            source,
        })?;
    Ok(DecodedReport {
        topic: d.topic.clone(),
        partition: d.partition,
        key,
        report,
    })
}

/// Age of a report: now minus the egress timestamp of its last hop.
fn report_age(report: &Report, now_ns: u64) -> Option<u64> {
    let egress = report
        .hops
        .last()?
        .get(MetadataType::EgressTimestamp)
        .ok()??;
    Some(now_ns.saturating_sub(egress))
}

/// Subscribed reader that decodes one report per call and keeps stats.
pub struct ReportConsumer {
    subscriber: Box<dyn Subscriber>,
    stats: Arc<Stats>,
    clock: Arc<dyn Clock>,
}

impl ReportConsumer {
    pub async fn new(
        mut subscriber: Box<dyn Subscriber>,
        topics: &[String],
        stats: Arc<Stats>,
    ) -> Result<Self, TransportError> {
        subscriber.subscribe(topics).await?;
        Ok(Self {
            subscriber,
            stats,
            clock: Arc::new(SystemClock),
        })
    }

    /// Waits for the next message. Errors are per message; the consumer
    /// stays usable after any of them.
    pub async fn next(&mut self, timeout: Option<Duration>) -> Result<DecodedReport, ConsumeError> {
        let delivery = match self.subscriber.read(timeout).await {
            Ok(d) => d,
            Err(e) => {
                if e != TransportError::Timeout {
                    self.stats.record_read_error().await;
                }
                return Err(e.into());
            }
        };
        match decode_delivery(&delivery) {
            Ok(decoded) => {
                let age = report_age(&decoded.report, self.clock.now_ns());
                self.stats.record_received(age).await;
                Ok(decoded)
            }
            Err(e) => {
                self.stats.record_decode_error().await;
                Err(e)
            }
        }
    }
}

/// Subscribes to `config.topics` and decodes reports until Ctrl+C or
/// `max_messages`. Bad messages and read errors are logged and skipped.
pub async fn run_consumer(config: ConsumerConfig, transport: &dyn Transport) -> Result<StatsSnapshot> {
    info!(topics = ?config.topics, group = %config.group_id, "starting consumer");
    let subscriber = transport
        .subscriber(&config.group_id)
        .await
        .map_err(|e| anyhow::Error::msg(format!("subscriber error: {}", e)))?;
    let stats = Arc::new(Stats::new());
    let mut consumer = ReportConsumer::new(subscriber, &config.topics, stats.clone())
        .await
        .map_err(|e| anyhow::Error::msg(format!("subscribe error: {}", e)))?;

    let output = Arc::new(Mutex::new(match config.output_file {
        Some(ref path) => OutputWriter::new_csv(path.clone()).await?,
        None => OutputWriter::new_stdout(),
    }));

    let snapshot_handle = if config.snapshot_interval_secs > 0 {
        let stats_clone = Arc::clone(&stats);
        let out = Arc::clone(&output);
        let interval_secs = config.snapshot_interval_secs;
        Some(tokio::spawn(async move {
            let mut interval_timer = interval(Duration::from_secs(interval_secs));
            interval_timer.tick().await;
            loop {
                interval_timer.tick().await;
                let snapshot = stats_clone.snapshot().await;
                let _ = out.lock().await.write_snapshot(&snapshot).await;
            }
        }))
    } else {
        None
    };

    let mut decoded = 0u64;
    let consume_loop = async {
        loop {
            if config.max_messages.is_some_and(|max| decoded >= max) {
                break;
            }
            match consumer.next(None).await {
                Ok(d) => {
                    decoded += 1;
                    if config.print_reports {
                        println!("Message on {}[{}]:", d.topic, d.partition);
                        println!("Flow key: {}", d.key);
                        print!("Report: {}", d.report);
                    }
                }
                Err(e) if e.is_decode() => warn!(error = %e, "could not decode message"),
                Err(e) => {
                    warn!(error = %e, "consumer error");
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }
    };

    tokio::select! {
        _ = consume_loop => {
            info!("message limit reached, stopping consumer");
        }
        _ = signal::ctrl_c() => {
            info!("Ctrl+C received, stopping consumer");
        }
    }

    if let Some(h) = snapshot_handle {
        h.abort();
    }
    let final_stats = stats.snapshot().await;
    output.lock().await.write_snapshot(&final_stats).await?;
    println!("\nFinal Consumer Statistics:");
    println!("  Reports received: {}", final_stats.received_count);
    println!("  Decode errors: {}", final_stats.decode_errors);
    println!("  Read errors: {}", final_stats.read_errors);
    println!("  Average rate: {:.2} reports/s", final_stats.total_throughput());
    println!(
        "  Report age P50/P99: {:.3}ms / {:.3}ms",
        final_stats.latency_ns_p50 as f64 / 1_000_000.0,
        final_stats.latency_ns_p99 as f64 / 1_000_000.0
    );
    Ok(final_stats)
}
