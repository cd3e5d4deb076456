use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::persisted::PersistedInstanceData;

/// Hands running instances from a disposed controller to its replacement.
///
/// Keyed by profile id. Entries are stored in their text encoding and consumed
/// on retrieval. Lives for the process; one store is shared by every controller.
#[derive(Debug, Default)]
pub struct LegacyInstanceStore {
    entries: DashMap<String, Vec<String>>,
}

impl LegacyInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever was stored for `profile_id`. An empty list removes the entry.
    pub fn store(&self, profile_id: &str, instances: &[PersistedInstanceData]) {
        if instances.is_empty() {
            self.entries.remove(profile_id);
            debug!(%profile_id, "No legacy instances to store");
            return;
        }
        let encoded = instances.iter().map(ToString::to_string).collect();
        self.entries.insert(profile_id.to_string(), encoded);
        info!(%profile_id, count = instances.len(), "Stored legacy instances");
    }

    /// Removes and decodes the snapshots for `profile_id`. Undecodable records are skipped.
    pub fn retrieve_and_clear(&self, profile_id: &str) -> Vec<PersistedInstanceData> {
        let Some((_, encoded)) = self.entries.remove(profile_id) else {
            return Vec::new();
        };
        encoded
            .iter()
            .filter_map(|line| match line.parse::<PersistedInstanceData>() {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!(%profile_id, record = %line, error = %e, "Skipping unreadable legacy record");
                    None
                }
            })
            .collect()
    }

    pub fn has_instances(&self, profile_id: &str) -> bool {
        self.entries
            .get(profile_id)
            .map_or(false, |e| !e.is_empty())
    }

    pub fn instance_count(&self, profile_id: &str) -> usize {
        self.entries.get(profile_id).map_or(0, |e| e.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
