//! Static routing table: job kind → queue, queue → concurrency policy.
//!
//! Loaded once at startup and validated before anything is routed, so an
//! `UnknownJobKind` at runtime means a kind the deployment never declared.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{RouteError, RoutingError};
use crate::job::JobKind;

/// Concurrency policy of one named queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    pub name: String,
    /// Maximum simultaneously running jobs across every process attached to the queue.
    pub max_concurrency: usize,
}

impl QueuePolicy {
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrency,
        }
    }
}

/// On-disk shape of the routing table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRoutingTable {
    queues: Vec<QueuePolicy>,
    routes: BTreeMap<JobKind, String>,
}

/// Validated routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRoutingTable", into = "RawRoutingTable")]
pub struct RoutingTable {
    queues: BTreeMap<String, QueuePolicy>,
    routes: HashMap<JobKind, String>,
}

impl RoutingTable {
    pub fn new(
        queues: impl IntoIterator<Item = QueuePolicy>,
        routes: impl IntoIterator<Item = (JobKind, String)>,
    ) -> Result<Self, RoutingError> {
        let mut by_name = BTreeMap::new();
        for policy in queues {
            if policy.name.trim().is_empty() {
                return Err(RoutingError::EmptyQueueName);
            }
            if policy.max_concurrency == 0 {
                return Err(RoutingError::ZeroConcurrency(policy.name));
            }
            if by_name.contains_key(&policy.name) {
                return Err(RoutingError::DuplicateQueue(policy.name));
            }
            by_name.insert(policy.name.clone(), policy);
        }

        let mut table = HashMap::new();
        for (kind, queue) in routes {
            if !by_name.contains_key(&queue) {
                return Err(RoutingError::UndeclaredQueue { kind, queue });
            }
            table.insert(kind, queue);
        }

        Ok(Self {
            queues: by_name,
            routes: table,
        })
    }

    /// The observed deployment: three strictly serial pools.
    pub fn default_topology() -> Self {
        let queues = [
            QueuePolicy::new("volitas", 1),
            QueuePolicy::new("correlations", 1),
            QueuePolicy::new("volume_queue", 1),
        ];
        let routes = [
            (JobKind::VolumeRecompute, "volume_queue".to_string()),
            (JobKind::CorrelationRecompute, "correlations".to_string()),
            (JobKind::Default, "volitas".to_string()),
        ];
        let mut by_name = BTreeMap::new();
        for q in queues {
            by_name.insert(q.name.clone(), q);
        }
        Self {
            queues: by_name,
            routes: routes.into_iter().collect(),
        }
    }

    /// Queue policy for a job kind.
    pub fn route(&self, kind: &JobKind) -> Result<&QueuePolicy, RouteError> {
        self.routes
            .get(kind)
            .and_then(|queue| self.queues.get(queue))
            .ok_or_else(|| RouteError::UnknownJobKind(kind.clone()))
    }

    pub fn queue(&self, name: &str) -> Option<&QueuePolicy> {
        self.queues.get(name)
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueuePolicy> {
        self.queues.values()
    }

    /// Kinds routed to `queue`, sorted by name.
    pub fn kinds_for(&self, queue: &str) -> Vec<&JobKind> {
        let mut kinds: Vec<&JobKind> = self
            .routes
            .iter()
            .filter(|(_, q)| q.as_str() == queue)
            .map(|(kind, _)| kind)
            .collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }
}

impl TryFrom<RawRoutingTable> for RoutingTable {
    type Error = RoutingError;

    fn try_from(raw: RawRoutingTable) -> Result<Self, Self::Error> {
        RoutingTable::new(raw.queues, raw.routes)
    }
}

impl From<RoutingTable> for RawRoutingTable {
    fn from(table: RoutingTable) -> Self {
        Self {
            queues: table.queues.into_values().collect(),
            routes: table.routes.into_iter().collect(),
        }
    }
}
