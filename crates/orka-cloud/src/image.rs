use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::{ImageConfig, InstanceLimit};
use crate::instance::Instance;
use crate::persisted::PersistedInstanceData;
use crate::ssh::SshCredentials;
use crate::status::InstanceStatus;
use crate::{CloudError, ErrorInfo, Result};

/// A VM template offered by one profile, with its live instances.
pub struct Image {
    id: String,
    display_name: String,
    namespace: String,
    config: ImageConfig,
    instances: DashMap<String, Arc<Instance>>,
    admission: Mutex<()>,
    error: RwLock<Option<ErrorInfo>>,
}

impl Image {
    pub fn new(profile_id: &str, profile_name: &str, namespace: &str, config: ImageConfig) -> Self {
        Self {
            id: Self::image_id(profile_id, &config.template),
            display_name: format!("{profile_name} ({})", config.template),
            namespace: namespace.to_string(),
            config,
            instances: DashMap::new(),
            admission: Mutex::new(()),
            error: RwLock::new(None),
        }
    }

    /// Image ids combine profile and template so two profiles can share a template.
    pub fn image_id(profile_id: &str, template: &str) -> String {
        format!("{profile_id}_{template}")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.display_name
    }

    pub fn template(&self) -> &str {
        &self.config.template
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn credentials(&self) -> &SshCredentials {
        &self.config.credentials
    }

    pub fn agent_directory(&self) -> &str {
        &self.config.agent_directory
    }

    pub fn instance_limit(&self) -> InstanceLimit {
        self.config.instance_limit
    }

    pub fn vm_metadata(&self) -> &HashMap<String, String> {
        &self.config.vm_metadata
    }

    pub fn agent_pool_id(&self) -> Option<i32> {
        self.config.agent_pool_id
    }

    /// Instances counted against the limit. Legacy instances are not.
    pub fn live_count(&self) -> usize {
        self.instances.iter().filter(|e| !e.value().is_legacy()).count()
    }

    pub fn can_start_new_instance(&self) -> bool {
        self.config.instance_limit.admits(self.live_count())
    }

    /// Registers a new instance under `id` if the limit allows it.
    pub fn start_new_instance(&self, id: &str) -> Result<Arc<Instance>> {
        let _admission = self
            .admission
            .lock()
            .map_err(|e| CloudError::LockPoisoned(e.to_string()))?;

        if !self.can_start_new_instance() {
            return Err(CloudError::Quota(
                "Maximum number of instances already launched.".to_string(),
            ));
        }

        let instance = Arc::new(Instance::new(id, &self.id, &self.namespace));
        self.instances.insert(id.to_string(), instance.clone());
        debug!(image_id = %self.id, instance_id = %id, "Registered new instance");
        Ok(instance)
    }

    pub fn add_legacy_instance(&self, instance: Arc<Instance>) {
        info!(image_id = %self.id, instance_id = %instance.id(), "Attached legacy instance");
        self.instances.insert(instance.id(), instance);
    }

    pub fn find_instance(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.get(id).map(|e| e.value().clone())
    }

    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    pub fn legacy_instances(&self) -> Vec<Arc<Instance>> {
        self.instances
            .iter()
            .filter(|e| e.value().is_legacy())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Moves the instance registered as `old_id` to `new_id`.
    ///
    /// The new key is inserted before the old one is removed, so lookups never
    /// miss the instance while it moves.
    pub fn rekey_instance(&self, old_id: &str, new_id: &str) -> Result<Arc<Instance>> {
        let _admission = self
            .admission
            .lock()
            .map_err(|e| CloudError::LockPoisoned(e.to_string()))?;

        let instance = self
            .find_instance(old_id)
            .ok_or_else(|| CloudError::NotFound(format!("instance {old_id} in {}", self.id)))?;
        if old_id == new_id {
            return Ok(instance);
        }
        instance.set_id(new_id);
        self.instances.insert(new_id.to_string(), instance.clone());
        self.instances.remove(old_id);
        debug!(image_id = %self.id, %old_id, %new_id, "Rekeyed instance");
        Ok(instance)
    }

    pub fn remove_instance(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.remove(id).map(|(_, instance)| instance)
    }

    pub fn error_info(&self) -> Option<ErrorInfo> {
        self.error.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_error_info(&self, error: Option<ErrorInfo>) {
        *self.error.write().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Snapshots of running, non-legacy instances for the legacy store.
    pub fn instances_for_persistence(&self) -> Vec<PersistedInstanceData> {
        self.instances
            .iter()
            .filter(|e| !e.value().is_legacy() && e.value().status() == InstanceStatus::Running)
            .map(|e| e.value().to_persisted())
            .collect()
    }

    pub fn clear(&self) {
        self.instances.clear();
    }
}
