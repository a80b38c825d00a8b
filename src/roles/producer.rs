use crate::clock::{Clock, SystemClock};
use crate::rate::RateController;
use crate::report::FlowKey;
use crate::report::assemble::{Path, ReportAssembler};
use crate::topology::{provision_topics, topic_name};
use crate::transport::{DeliveryReport, PartitionSelector, Transport};
use anyhow::Result;
use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Flow ids are drawn below this bound.
const FLOW_ID_LIMIT: u32 = 1 << 20;

pub struct ProducerConfig {
    pub events: u64,
    pub flows: u32,
    /// Events per second; `None` sends as fast as possible.
    pub rate: Option<f64>,
    pub flush_timeout: Duration,
    /// Node id every simulated hop reports.
    pub node_id: u32,
    pub seed: Option<u64>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            events: 0,
            flows: 1,
            rate: None,
            flush_timeout: Duration::from_secs(1),
            node_id: 1,
            seed: None,
        }
    }
}

/// AS-level path and the topic its reports go to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomRoute {
    pub topic: String,
    pub asns: Vec<u64>,
}

/// Both directions between ff00:0:1 and ff00:0:4, over different transit ASes.
pub fn example_routes() -> Vec<RandomRoute> {
    vec![
        RandomRoute {
            topic: topic_name(0xff00_0000_0001, 1),
            asns: vec![0xff00_0000_0001, 0xff00_0000_0002, 0xff00_0000_0004],
        },
        RandomRoute {
            topic: topic_name(0xff00_0000_0004, 1),
            asns: vec![0xff00_0000_0004, 0xff00_0000_0003, 0xff00_0000_0001],
        },
    ]
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProducerSummary {
    pub enqueued: u64,
    pub encode_failures: u64,
    pub enqueue_failures: u64,
    pub undelivered: u64,
    /// Delivery reports seen by the end of the flush.
    pub delivered: u64,
    pub delivery_failures: u64,
}

impl ProducerSummary {
    fn record_delivery(&mut self, report: &DeliveryReport) {
        match &report.error {
            None => {
                self.delivered += 1;
                debug!(topic = %report.topic, partition = report.partition, offset = ?report.offset, "message delivered");
            }
            Some(e) => {
                self.delivery_failures += 1;
                warn!(topic = %report.topic, partition = report.partition, error = %e, "delivery failed");
            }
        }
    }
}

/// Logs delivery outcomes as they arrive. On `stop` it takes whatever is
/// already queued and returns the tally.
async fn monitor_deliveries(
    reports: flume::Receiver<DeliveryReport>,
    mut stop: oneshot::Receiver<()>,
) -> ProducerSummary {
    let mut tally = ProducerSummary::default();
    loop {
        tokio::select! {
            next = reports.recv_async() => match next {
                Ok(report) => tally.record_delivery(&report),
                Err(_) => break,
            },
            _ = &mut stop => break,
        }
    }
    for report in reports.try_iter() {
        tally.record_delivery(&report);
    }
    tally
}

/// Publishes `cfg.events` random SCION reports, each on a randomly chosen
/// route and flow, then flushes once.
pub async fn run_producer(cfg: ProducerConfig, transport: &dyn Transport) -> Result<ProducerSummary> {
    let routes = example_routes();
    let topics: Vec<String> = routes.iter().map(|r| r.topic.clone()).collect();
    provision_topics(transport, &topics)
        .await
        .map_err(|e| anyhow::Error::msg(format!("topic provisioning error: {}", e)))?;
    let publisher = transport
        .publisher()
        .await
        .map_err(|e| anyhow::Error::msg(format!("create publisher error: {}", e)))?;

    let mut rng = match cfg.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let flow_ids: Vec<u32> = (0..cfg.flows.max(1))
        .map(|_| rng.gen_range(0..FLOW_ID_LIMIT))
        .collect();

    // keys[route][flow], marshaled once
    let mut keys: Vec<Vec<Bytes>> = Vec::with_capacity(routes.len());
    for route in &routes {
        let (src, dst) = match (route.asns.first(), route.asns.last()) {
            (Some(s), Some(d)) => (*s, *d),
            _ => (0, 0),
        };
        let row = flow_ids
            .iter()
            .map(|id| FlowKey::new(src, dst, *id).marshal())
            .collect::<Result<Vec<_>, _>>()?;
        keys.push(row);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let paths: Vec<Path> = routes
        .iter()
        .map(|r| Path::random(&r.asns, cfg.node_id, clock.clone()))
        .collect();
    let assembler = ReportAssembler::scion();
    let mut report = assembler.new_report();
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut rate = cfg.rate.filter(|r| *r > 0.0).map(RateController::new);
    let mut summary = ProducerSummary::default();
    let (stop_monitor, stop) = oneshot::channel();
    let monitor = tokio::spawn(monitor_deliveries(publisher.delivery_reports(), stop));

    info!(events = cfg.events, flows = flow_ids.len(), "producing random reports");
    for seq in 0..cfg.events {
        if let Some(rc) = &mut rate {
            rc.wait_for_next().await;
        }
        let r = rng.gen_range(0..routes.len());
        let f = rng.gen_range(0..flow_ids.len());

        assembler.fill(&mut report, &paths[r]);
        let value = match report.marshal_into(&mut buf) {
            Ok(v) => v,
            Err(e) => {
                summary.encode_failures += 1;
                warn!(seq, error = %e, "skipping report that failed to encode");
                continue;
            }
        };
        match publisher
            .enqueue(&routes[r].topic, PartitionSelector::Any, keys[r][f].clone(), value)
            .await
        {
            Ok(()) => summary.enqueued += 1,
            Err(e) => {
                summary.enqueue_failures += 1;
                warn!(seq, topic = %routes[r].topic, error = %e, "enqueue failed");
            }
        }
    }

    summary.undelivered = publisher.flush(cfg.flush_timeout).await as u64;
    if summary.undelivered > 0 {
        warn!(undelivered = summary.undelivered, "reports still queued after flush");
    }
    let _ = stop_monitor.send(());
    let tally = monitor
        .await
        .map_err(|e| anyhow::Error::msg(format!("delivery monitor error: {}", e)))?;
    summary.delivered = tally.delivered;
    summary.delivery_failures = tally.delivery_failures;
    info!(
        enqueued = summary.enqueued,
        delivered = summary.delivered,
        delivery_failures = summary.delivery_failures,
        "producer finished"
    );
    Ok(summary)
}
