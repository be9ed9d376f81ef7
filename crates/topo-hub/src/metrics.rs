use crate::hub::HubHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use topo_core::Metrics;
use tracing::{debug, info};

pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

pub trait MetricsSource: Send + Sync {
    fn sample(&self) -> Metrics;
}

#[derive(Debug, Clone, Copy)]
pub struct FixedMetrics(pub Metrics);

impl Default for FixedMetrics {
    fn default() -> Self {
        Self(Metrics {
            cpu: 50.0,
            memory: 60.0,
            storage: 70.0,
            network: 80.0,
        })
    }
}

impl MetricsSource for FixedMetrics {
    fn sample(&self) -> Metrics {
        self.0
    }
}

pub fn spawn_sampler(
    hub: HubHandle,
    source: Arc<dyn MetricsSource>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if interval.is_zero() {
            return;
        }
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(event = "metrics_sampler_start", interval_ms = interval.as_millis() as u64);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let metrics = source.sample();
                    debug!(event = "metrics_sampled", cpu = metrics.cpu, memory = metrics.memory);
                    hub.publish_metrics(metrics).await;
                }
            }
        }
        info!(event = "metrics_sampler_stop");
    })
}
