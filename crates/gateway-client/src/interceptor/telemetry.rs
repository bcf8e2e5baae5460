//! Per-method latency and error telemetry

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{ErrorContext, Interceptor, OutboundAction, Phase};
use crate::protocol::{InboundMessage, OutboundMessage};

const DEFAULT_SAMPLE_SIZE: usize = 100;

/// Snapshot of one method's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodMetrics {
    pub count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
}

#[derive(Default)]
struct MethodStats {
    count: u64,
    error_count: u64,
    total_latency: Duration,
    samples: VecDeque<Duration>,
}

impl MethodStats {
    fn record(&mut self, latency: Duration, is_error: bool, capacity: usize) {
        self.count += 1;
        if is_error {
            self.error_count += 1;
        }
        self.total_latency += latency;
        if self.samples.len() == capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    fn snapshot(&self) -> MethodMetrics {
        let avg_latency_ms = if self.count == 0 {
            0.0
        } else {
            as_millis_f64(self.total_latency) / self.count as f64
        };
        MethodMetrics {
            count: self.count,
            error_count: self.error_count,
            avg_latency_ms,
            p95_latency_ms: as_millis_f64(p95(&self.samples)),
        }
    }
}

fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_micros() as f64 / 1000.0
}

/// Nearest-rank 95th percentile
fn p95(samples: &VecDeque<Duration>) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let mut sorted: Vec<Duration> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let rank = (0.95 * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1)]
}

#[derive(Default)]
struct TelemetryState {
    in_flight: HashMap<String, (String, Instant)>,
    methods: HashMap<String, MethodStats>,
}

/// Records request latency per method from outbound/inbound timestamps
pub struct TelemetryInterceptor {
    sample_size: usize,
    state: Mutex<TelemetryState>,
}

impl Default for TelemetryInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryInterceptor {
    pub fn new() -> Self {
        Self::with_sample_size(DEFAULT_SAMPLE_SIZE)
    }

    /// Keep the last `sample_size` latencies per method for the p95 estimate
    pub fn with_sample_size(sample_size: usize) -> Self {
        Self {
            sample_size: sample_size.max(1),
            state: Mutex::new(TelemetryState::default()),
        }
    }

    pub async fn metrics(&self) -> HashMap<String, MethodMetrics> {
        let state = self.state.lock().await;
        state
            .methods
            .iter()
            .map(|(method, stats)| (method.clone(), stats.snapshot()))
            .collect()
    }

    pub async fn method_metrics(&self, method: &str) -> Option<MethodMetrics> {
        self.state.lock().await.methods.get(method).map(MethodStats::snapshot)
    }

    pub async fn reset_metrics(&self) {
        let mut state = self.state.lock().await;
        state.in_flight.clear();
        state.methods.clear();
    }

    async fn finish(&self, id: &str, is_error: bool) {
        let mut state = self.state.lock().await;
        let Some((method, started)) = state.in_flight.remove(id) else {
            return;
        };
        let latency = started.elapsed();
        let capacity = self.sample_size;
        state
            .methods
            .entry(method)
            .or_default()
            .record(latency, is_error, capacity);
    }
}

#[async_trait]
impl Interceptor for TelemetryInterceptor {
    fn name(&self) -> &str {
        "telemetry"
    }

    async fn on_outbound(&self, msg: &OutboundMessage) -> anyhow::Result<OutboundAction> {
        self.state
            .lock()
            .await
            .in_flight
            .insert(msg.id.clone(), (msg.method.clone(), Instant::now()));
        Ok(OutboundAction::Forward)
    }

    async fn on_inbound(&self, msg: &InboundMessage) -> anyhow::Result<Option<InboundMessage>> {
        self.finish(&msg.id, msg.is_error()).await;
        Ok(None)
    }

    async fn on_error(&self, _error: &anyhow::Error, ctx: &ErrorContext) -> anyhow::Result<()> {
        let Some(id) = &ctx.request_id else {
            return Ok(());
        };
        match ctx.phase {
            // A request that never got a response still counts as a failed call.
            Phase::Request => self.finish(id, true).await,
            // Never sent, so there is no latency to record
            Phase::Halted => {
                self.state.lock().await.in_flight.remove(id);
            }
            Phase::Outbound | Phase::Inbound | Phase::Event => {}
        }
        Ok(())
    }
}
