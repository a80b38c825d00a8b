use crate::metrics::stats::StatsSnapshot;
use anyhow::Result;
use serde::Serialize;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Destination for periodic consumer snapshots.
pub enum OutputWriter {
    Csv(BufWriter<File>),
    Stdout,
}

async fn ensure_parent(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.ok();
        }
    }
}

impl OutputWriter {
    pub async fn new_csv(path: String) -> Result<Self> {
        ensure_parent(&path).await;
        let file = File::create(&path).await?;
        let mut writer = BufWriter::new(file);
        writer.write_all(StatsSnapshot::csv_header().as_bytes()).await?;
        writer.write_all(b"\n").await?;
        tracing::info!(path = %path, "writing consumer stats CSV");
        Ok(Self::Csv(writer))
    }

    pub fn new_stdout() -> Self {
        Self::Stdout
    }

    pub async fn write_snapshot(&mut self, snapshot: &StatsSnapshot) -> Result<()> {
        match self {
            Self::Csv(writer) => {
                writer.write_all(snapshot.to_csv_row().as_bytes()).await?;
                writer.write_all(b"\n").await?;
                // Flush so external tail/readers see progress promptly
                writer.flush().await?;
            }
            Self::Stdout => {
                println!(
                    "Consumer stats - Received: {}, Decode errors: {}, Read errors: {}, Rate: {:.2} reports/s, P99 age: {:.3}ms",
                    snapshot.received_count,
                    snapshot.decode_errors,
                    snapshot.read_errors,
                    snapshot.interval_throughput(),
                    snapshot.latency_ns_p99 as f64 / 1_000_000.0
                );
            }
        }
        Ok(())
    }
}

/// Writes `value` as pretty JSON, creating parent directories as needed.
pub async fn write_json<T: Serialize>(path: &str, value: &T) -> Result<()> {
    ensure_parent(path).await;
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(path, body).await?;
    Ok(())
}
