//! Per-pool occupancy and readiness, for the deployment layer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use volitas_core::RoutingTable;

use crate::queue::JobQueue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub queue: String,
    pub max_concurrency: usize,
    pub in_flight: usize,
    pub backlog: usize,
    /// The queue answered its probe within the latency bound.
    pub ready: bool,
    pub probe_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct HealthReporter {
    table: Arc<RoutingTable>,
    queue: Arc<dyn JobQueue>,
    max_latency: Duration,
}

impl HealthReporter {
    pub fn new(table: Arc<RoutingTable>, queue: Arc<dyn JobQueue>, max_latency: Duration) -> Self {
        Self {
            table,
            queue,
            max_latency,
        }
    }

    /// Probe every configured queue. The probe is the same admission query a
    /// claim runs, so a pool that answers in time can also claim in time.
    pub async fn report(&self) -> Vec<PoolHealth> {
        let mut pools = Vec::new();
        for policy in self.table.queues() {
            pools.push(self.probe(&policy.name, policy.max_concurrency).await);
        }
        pools
    }

    async fn probe(&self, queue: &str, max_concurrency: usize) -> PoolHealth {
        let started = Instant::now();
        let probe = async {
            let in_flight = self.queue.in_flight(queue).await?;
            let backlog = self.queue.backlog(queue).await?;
            Ok::<_, crate::error::StoreError>((in_flight, backlog))
        };

        let (in_flight, backlog, error) = match tokio::time::timeout(self.max_latency, probe).await {
            Ok(Ok((in_flight, backlog))) => (in_flight, backlog, None),
            Ok(Err(e)) => (0, 0, Some(e.to_string())),
            Err(_) => (0, 0, Some(format!("probe exceeded {} ms", self.max_latency.as_millis()))),
        };
        let latency = started.elapsed();

        PoolHealth {
            queue: queue.to_string(),
            max_concurrency,
            in_flight,
            backlog,
            ready: error.is_none() && latency <= self.max_latency,
            probe_latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            error,
        }
    }
}
