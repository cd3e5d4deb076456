//! Cluster capacity snapshots and the cache that gates admission on them.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use orka_client::{OrkaNode, OrkaVmConfig, VmApi};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct CapacityInfo {
    pub total_available_cpu: u32,
    pub total_available_memory_gb: f64,
    pub node_count: usize,
    pub ready_node_count: usize,
    pub has_capacity: bool,
    pub message: String,
}

impl CapacityInfo {
    pub fn no_capacity(message: impl Into<String>) -> Self {
        Self {
            total_available_cpu: 0,
            total_available_memory_gb: 0.0,
            node_count: 0,
            ready_node_count: 0,
            has_capacity: false,
            message: message.into(),
        }
    }

    pub fn check_failed(reason: impl std::fmt::Display) -> Self {
        Self::no_capacity(format!("Capacity check failed: {reason}"))
    }

    /// Decides whether one more VM of `config` fits on any eligible node.
    pub fn from_nodes(config: &OrkaVmConfig, nodes: &[OrkaNode]) -> Self {
        let ready: Vec<&OrkaNode> = nodes.iter().filter(|n| n.is_ready()).collect();
        let required_memory = config.memory_gb();

        let fitting = ready
            .iter()
            .filter(|n| config.node_name.as_deref().map_or(true, |pinned| n.name == pinned))
            .filter(|n| {
                !config.tag_required || config.tag.as_deref().map_or(true, |tag| n.has_tag(tag))
            })
            .filter(|n| n.available_cpu >= config.cpu && n.available_memory_gb() >= required_memory)
            .count();

        let message = if ready.is_empty() {
            "No ready nodes in the cluster".to_string()
        } else if fitting == 0 {
            format!(
                "No node has {} CPU and {:.2}G memory available for {}",
                config.cpu, required_memory, config.name
            )
        } else {
            format!("{fitting} node(s) can host {}", config.name)
        };

        Self {
            total_available_cpu: ready.iter().map(|n| n.available_cpu).sum(),
            total_available_memory_gb: ready.iter().map(|n| n.available_memory_gb()).sum(),
            node_count: nodes.len(),
            ready_node_count: ready.len(),
            has_capacity: fitting > 0,
            message,
        }
    }
}

/// Fetches the template and node list and computes a fresh [`CapacityInfo`].
pub async fn probe_capacity(api: &dyn VmApi, template: &str) -> CapacityInfo {
    let config = match api.vm_config(template).await {
        Ok(Some(config)) => config,
        Ok(None) => return CapacityInfo::check_failed(format!("VM config {template} not found")),
        Err(e) => return CapacityInfo::check_failed(e),
    };
    match api.list_nodes().await {
        Ok(nodes) => CapacityInfo::from_nodes(&config, &nodes.items),
        Err(e) => CapacityInfo::check_failed(e),
    }
}

/// Immutable result of the most recent probe.
#[derive(Debug, Clone, Default)]
pub struct CapacityCacheEntry {
    capacity: Option<CapacityInfo>,
    checked_at: Option<Instant>,
    failed_at: Option<Instant>,
    failure_reason: Option<String>,
}

impl CapacityCacheEntry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn success_at(capacity: CapacityInfo, now: Instant) -> Self {
        Self {
            capacity: Some(capacity),
            checked_at: Some(now),
            failed_at: None,
            failure_reason: None,
        }
    }

    pub fn failure_at(reason: impl Into<String>, now: Instant) -> Self {
        Self {
            capacity: None,
            checked_at: Some(now),
            failed_at: Some(now),
            failure_reason: Some(reason.into()),
        }
    }

    pub fn with_cleared_backoff() -> Self {
        Self::empty()
    }

    pub fn capacity(&self) -> Option<&CapacityInfo> {
        self.capacity.as_ref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn is_failure(&self) -> bool {
        self.failed_at.is_some()
    }

    pub fn is_in_backoff_at(&self, backoff: Duration, now: Instant) -> bool {
        self.failed_at
            .map_or(false, |t| now.saturating_duration_since(t) <= backoff)
    }

    pub fn remaining_backoff_secs_at(&self, backoff: Duration, now: Instant) -> u64 {
        self.failed_at.map_or(0, |t| {
            backoff
                .saturating_sub(now.saturating_duration_since(t))
                .as_secs()
        })
    }

    pub fn is_cache_valid_at(&self, ttl: Duration, now: Instant) -> bool {
        self.capacity.is_some()
            && self
                .checked_at
                .map_or(false, |t| now.saturating_duration_since(t) <= ttl)
    }
}

/// Outcome of consulting the gate without probing.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Allowed,
    Denied(String),
    /// Nothing usable is cached; a fresh probe decides.
    Unknown,
}

/// Holds the current [`CapacityCacheEntry`]. Entries are replaced, never mutated.
pub struct CapacityGate {
    entry: RwLock<Arc<CapacityCacheEntry>>,
    ttl: Duration,
    backoff: Duration,
}

impl CapacityGate {
    pub fn new(ttl: Duration, backoff: Duration) -> Self {
        Self {
            entry: RwLock::new(Arc::new(CapacityCacheEntry::empty())),
            ttl,
            backoff,
        }
    }

    pub fn snapshot(&self) -> Arc<CapacityCacheEntry> {
        self.entry
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn publish(&self, entry: CapacityCacheEntry) {
        *self.entry.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(entry);
    }

    pub fn check(&self) -> Admission {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> Admission {
        let entry = self.snapshot();
        if entry.is_in_backoff_at(self.backoff, now) {
            return Admission::Denied(format!(
                "{}. Retrying in {}s",
                entry.failure_reason().unwrap_or("No capacity"),
                entry.remaining_backoff_secs_at(self.backoff, now)
            ));
        }
        if entry.is_cache_valid_at(self.ttl, now) {
            if let Some(info) = entry.capacity() {
                return if info.has_capacity {
                    Admission::Allowed
                } else {
                    Admission::Denied(info.message.clone())
                };
            }
        }
        Admission::Unknown
    }

    /// Stores a probe result: success entries for room, failure entries otherwise.
    pub fn record(&self, info: CapacityInfo) {
        if info.has_capacity {
            debug!(message = %info.message, "Capacity available");
            self.publish(CapacityCacheEntry::success_at(info, Instant::now()));
        } else {
            warn!(reason = %info.message, backoff_secs = self.backoff.as_secs(), "No capacity, backing off");
            self.publish(CapacityCacheEntry::failure_at(info.message, Instant::now()));
        }
    }

    pub fn record_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, backoff_secs = self.backoff.as_secs(), "Capacity failure, backing off");
        self.publish(CapacityCacheEntry::failure_at(reason, Instant::now()));
    }

    /// Forgets the cached snapshot so the next check probes again.
    pub fn invalidate(&self) {
        self.publish(CapacityCacheEntry::empty());
    }

    pub fn clear_backoff(&self) {
        if self.snapshot().is_failure() {
            info!("Clearing capacity backoff");
            self.publish(CapacityCacheEntry::with_cleared_backoff());
        }
    }
}
