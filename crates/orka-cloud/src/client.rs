use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use orka_client::{EksTokenProvider, OrkaClient, StaticTokenProvider, TokenProvider, VmApi};
use orka_common::{AgentDescription, AgentMetadata};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::capacity::{probe_capacity, Admission, CapacityGate};
use crate::config::{ProfileConfig, TokenSource, Tuning};
use crate::executor::AsyncExecutor;
use crate::image::Image;
use crate::instance::Instance;
use crate::jobs::{self, graceful, reconcile};
use crate::legacy::LegacyInstanceStore;
use crate::ssh::{wait_for_ssh, RemoteAgent, RemoteShell, SshCommandRunner};
use crate::status::InstanceStatus;
use crate::vm_name;
use crate::{CloudError, ErrorInfo, Result};

const CAPACITY_ERROR_MARKER: &str = "Cannot deploy more than";
const DEFAULT_SSH_PORT: u16 = 22;

/// Controller for the images of one cloud profile.
///
/// Public entry points only touch in-memory state; deploys, SSH bootstrap and
/// deletes run as jobs on the client's [`AsyncExecutor`].
#[derive(Clone)]
pub struct CloudClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    profile_id: String,
    images: RwLock<Vec<Arc<Image>>>,
    api: Arc<dyn VmApi>,
    shell: Arc<dyn RemoteShell>,
    executor: AsyncExecutor,
    capacity: CapacityGate,
    node_mappings: HashMap<String, String>,
    legacy_store: Arc<LegacyInstanceStore>,
    tuning: Tuning,
    deployment_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl CloudClient {
    /// Builds a client talking to the real Orka API and VMs.
    pub fn from_config(config: ProfileConfig, legacy_store: Arc<LegacyInstanceStore>) -> Result<Self> {
        let tokens: Arc<dyn TokenProvider> = match &config.token_source {
            TokenSource::Static(token) => Arc::new(StaticTokenProvider::new(token.clone())),
            TokenSource::AwsIam { cluster, region } => {
                Arc::new(EksTokenProvider::new(cluster.clone(), region.clone()))
            }
        };
        if !tokens.is_valid() {
            return Err(CloudError::Config(format!(
                "Token source for profile {} is not configured",
                config.profile_id
            )));
        }

        let api = OrkaClient::with_timeout(
            &config.endpoint,
            &config.namespace,
            tokens,
            config.tuning.http_timeout,
        )?;
        let shell = SshCommandRunner::new(config.tuning.ssh_command_timeout);
        Self::new(config, Arc::new(api), Arc::new(shell), legacy_store)
    }

    /// Builds a client, adopts instances left behind by a previous client of
    /// the same profile and starts the maintenance timers.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        config: ProfileConfig,
        api: Arc<dyn VmApi>,
        shell: Arc<dyn RemoteShell>,
        legacy_store: Arc<LegacyInstanceStore>,
    ) -> Result<Self> {
        let images: Vec<Arc<Image>> = config
            .images
            .iter()
            .cloned()
            .map(|image| {
                Arc::new(Image::new(
                    &config.profile_id,
                    &config.profile_name,
                    &config.namespace,
                    image,
                ))
            })
            .collect();
        if images.is_empty() {
            return Err(CloudError::Config(format!(
                "Profile {} defines no images",
                config.profile_id
            )));
        }

        let tuning = config.tuning.clone();
        let inner = Arc::new(ClientInner {
            executor: AsyncExecutor::new(
                format!("orka-{}", config.profile_id),
                tuning.executor_threads,
            )?,
            capacity: CapacityGate::new(tuning.capacity_ttl, tuning.capacity_backoff),
            profile_id: config.profile_id,
            images: RwLock::new(images),
            api,
            shell,
            node_mappings: config.node_mappings,
            legacy_store,
            tuning,
            deployment_lock: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        });

        inner.adopt_legacy_instances();
        Self::schedule_maintenance(&inner)?;
        info!(profile_id = %inner.profile_id, "Orka cloud client initialized");
        Ok(Self { inner })
    }

    fn schedule_maintenance(inner: &Arc<ClientInner>) -> Result<()> {
        let tuning = &inner.tuning;

        let weak: Weak<ClientInner> = Arc::downgrade(inner);
        inner.executor.schedule_with_fixed_delay(
            "remove-failed-instances",
            tuning.reconcile_initial_delay,
            tuning.reconcile_interval,
            move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    reconcile::remove_failed_instances(
                        &inner.images(),
                        inner.api.as_ref(),
                        &inner.capacity,
                        inner.tuning.max_delete_attempts,
                    )
                    .await;
                    true
                }
            },
        )?;

        let weak: Weak<ClientInner> = Arc::downgrade(inner);
        inner.executor.schedule_with_fixed_delay(
            "graceful-legacy-shutdown",
            tuning.graceful_initial_delay,
            tuning.graceful_interval,
            move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    graceful::retire_legacy_instances(&inner.images());
                    true
                }
            },
        )
    }

    pub fn profile_id(&self) -> &str {
        &self.inner.profile_id
    }

    pub fn images(&self) -> Vec<Arc<Image>> {
        self.inner.images()
    }

    pub fn find_image_by_id(&self, image_id: &str) -> Option<Arc<Image>> {
        self.images().into_iter().find(|i| i.id() == image_id)
    }

    pub fn find_instance_by_id(&self, image_id: &str, instance_id: &str) -> Option<Arc<Instance>> {
        self.find_image_by_id(image_id)?.find_instance(instance_id)
    }

    /// Finds the instance a connecting agent runs on and records the connection.
    pub fn find_instance_by_agent(&self, agent: &AgentDescription) -> Option<Arc<Instance>> {
        let instance_id = agent.instance_id()?;
        let image_id = agent.image_id()?;

        let found = self.images().into_iter().find_map(|image| {
            image
                .find_instance(instance_id)
                .filter(|instance| instance.matches_agent(instance_id, image_id))
        });
        match &found {
            Some(instance) => {
                instance.mark_agent_connected();
            }
            None => debug!(%instance_id, %image_id, "No instance matches agent"),
        }
        found
    }

    /// Client-level error: the reason capacity is currently backing off, if any.
    pub fn error_info(&self) -> Option<ErrorInfo> {
        match self.inner.capacity.check() {
            Admission::Denied(reason) => Some(ErrorInfo::new("No capacity").with_details(reason)),
            _ => None,
        }
    }

    pub fn capacity(&self) -> &CapacityGate {
        &self.inner.capacity
    }

    /// Maps a host reported by the API to the address reachable from here.
    pub fn remap_host(&self, host: &str) -> String {
        self.inner.remap_host(host)
    }

    /// Limit and cached-capacity check, without probing the cluster.
    pub fn can_start_new_instance(&self, image: &Image) -> bool {
        if self.inner.is_disposed() || !image.can_start_new_instance() {
            return false;
        }
        !matches!(self.inner.capacity.check(), Admission::Denied(_))
    }

    /// Registers a new instance of `image` and schedules its deployment.
    ///
    /// Fails right away on misconfiguration, an exhausted image limit, or a
    /// capacity backoff. Deployment problems surface later as the instance's
    /// error info.
    #[instrument(skip(self, image), fields(image_id = %image.id()))]
    pub fn start_new_instance(&self, image: &Arc<Image>) -> Result<Arc<Instance>> {
        if self.inner.is_disposed() {
            return Err(CloudError::Internal("cloud client is disposed".to_string()));
        }
        if image.agent_directory().trim().is_empty() {
            return Err(CloudError::Config(format!(
                "Agent directory is not configured for {}",
                image.id()
            )));
        }
        if !image.can_start_new_instance() {
            return Err(CloudError::Quota(
                "Maximum number of instances already launched.".to_string(),
            ));
        }
        if let Admission::Denied(reason) = self.inner.capacity.check() {
            return Err(CloudError::Capacity(reason));
        }

        let placeholder = Uuid::new_v4().to_string();
        let instance = image.start_new_instance(&placeholder)?;

        let (turn, done) = instance.queue_job();
        let inner = self.inner.clone();
        let (job_image, job_instance) = (image.clone(), instance.clone());
        if let Err(e) = self.inner.executor.submit_after("provision", turn.wait(), async move {
            let _done = done;
            inner.provision(job_image, job_instance).await;
        }) {
            image.remove_instance(&placeholder);
            return Err(e);
        }

        info!(instance_id = %placeholder, "Scheduled new instance");
        Ok(instance)
    }

    /// Schedules termination: best-effort agent stop, then VM delete.
    ///
    /// Runs after any job already queued for the instance. A second call while
    /// a termination is pending is a no-op.
    #[instrument(skip(self, instance), fields(instance_id = %instance.id()))]
    pub fn terminate_instance(&self, instance: &Arc<Instance>) -> Result<()> {
        let image = self
            .find_image_by_id(instance.image_id())
            .ok_or_else(|| CloudError::NotFound(format!("image {}", instance.image_id())))?;

        if instance.status().is_terminal() {
            debug!("Instance already stopped");
            return Ok(());
        }
        if !instance.queue_termination() {
            debug!("Termination already queued");
            return Ok(());
        }
        instance.set_status(InstanceStatus::ScheduledToStop);

        let (turn, done) = instance.queue_job();
        let inner = self.inner.clone();
        let job_instance = instance.clone();
        let submitted = self.inner.executor.submit_after("terminate", turn.wait(), async move {
            let _done = done;
            inner.terminate(image, job_instance).await;
        });
        if submitted.is_err() {
            instance.clear_termination_queued();
        }
        submitted
    }

    pub fn restart_instance(&self, instance: &Instance) {
        info!(instance_id = %instance.id(), "Restart is not supported for Orka instances, ignoring");
    }

    /// Hands running instances to the legacy store and stops all background work.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let images = self.images();

        let snapshots: Vec<_> = images
            .iter()
            .flat_map(|image| image.instances_for_persistence())
            .collect();
        self.inner
            .legacy_store
            .store(&self.inner.profile_id, &snapshots);

        self.inner
            .executor
            .shutdown(self.inner.tuning.shutdown_drain)
            .await;

        for image in &images {
            image.clear();
        }
        self.inner
            .images
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(profile_id = %self.inner.profile_id, handed_off = snapshots.len(), "Orka cloud client disposed");
    }
}

impl ClientInner {
    fn images(&self) -> Vec<Arc<Image>> {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn remap_host(&self, host: &str) -> String {
        self.node_mappings
            .get(&host.to_lowercase())
            .cloned()
            .unwrap_or_else(|| host.to_string())
    }

    /// Attaches instances handed over by a previous client as legacy instances.
    fn adopt_legacy_instances(&self) {
        let snapshots = self.legacy_store.retrieve_and_clear(&self.profile_id);
        if snapshots.is_empty() {
            return;
        }
        let images = self.images();
        for snapshot in snapshots {
            let target = images
                .iter()
                .find(|i| i.id() == snapshot.image_id)
                .or_else(|| images.first());
            let Some(image) = target else {
                warn!(instance_id = %snapshot.instance_id, "No image to attach legacy instance to");
                continue;
            };
            let data = snapshot.as_legacy(image.id());
            image.add_legacy_instance(Arc::new(Instance::from_legacy_snapshot(&data)));
        }
    }

    fn deploy_metadata(&self, image: &Image) -> HashMap<String, String> {
        let mut metadata = image.vm_metadata().clone();
        metadata.insert("tc_profile_id".to_string(), self.profile_id.clone());
        metadata.insert("tc_image_id".to_string(), image.id().to_string());
        metadata
    }

    /// Honors the cached capacity decision, probing the cluster when nothing is cached.
    async fn ensure_capacity(&self, template: &str) -> Result<()> {
        match self.capacity.check() {
            Admission::Allowed => Ok(()),
            Admission::Denied(reason) => Err(CloudError::Capacity(reason)),
            Admission::Unknown => {
                let info = probe_capacity(self.api.as_ref(), template).await;
                let (has_capacity, message) = (info.has_capacity, info.message.clone());
                self.capacity.record(info);
                if has_capacity {
                    Ok(())
                } else {
                    Err(CloudError::Capacity(message))
                }
            }
        }
    }

    fn note_deploy_error(&self, message: &str) {
        if message.contains(CAPACITY_ERROR_MARKER) {
            self.capacity.record_failure(message);
        }
    }

    async fn provision(&self, image: Arc<Image>, instance: Arc<Instance>) {
        let _token = instance.acquire_job_token().await;
        if let Err(e) = self.provision_steps(&image, &instance).await {
            instance.fail(ErrorInfo::from(&e));
        }
    }

    #[instrument(skip_all, fields(image_id = %image.id(), instance_id = %instance.starting_id()))]
    async fn provision_steps(&self, image: &Image, instance: &Instance) -> Result<()> {
        let deployed = {
            let _deploying = self.deployment_lock.lock().await;
            if instance.status() != InstanceStatus::ScheduledToStart {
                info!(status = %instance.status(), "Instance left the start queue, not deploying");
                return Ok(());
            }
            self.ensure_capacity(image.template()).await?;

            let metadata = self.deploy_metadata(image);
            let vm_name = vm_name::generate(&metadata);
            debug!(%vm_name, template = %image.template(), "Deploying VM");
            let response = match self.api.deploy(&vm_name, image.template(), &metadata).await {
                Ok(response) => response,
                Err(e) => {
                    self.note_deploy_error(&e.to_string());
                    return Err(e.into());
                }
            };
            if !response.is_success() {
                let message = response.error_message();
                self.note_deploy_error(&message);
                return Err(CloudError::Deployment(message));
            }
            self.capacity.invalidate();
            response
        };

        let vm_id = deployed.name.clone();
        image.rekey_instance(instance.starting_id(), &vm_id)?;

        let listed = self.api.get_vm(image.template()).await?;
        if !listed.instance_ids().contains(&vm_id.as_str()) {
            warn!(%vm_id, "VM not found after deployment, dropping instance");
            instance.set_status(InstanceStatus::Error);
            instance.set_status(InstanceStatus::Stopped);
            image.remove_instance(&vm_id);
            return Ok(());
        }

        let host = self.remap_host(&deployed.ip);
        let port = if deployed.ssh_port == 0 {
            DEFAULT_SSH_PORT
        } else {
            deployed.ssh_port
        };
        instance.set_endpoint(&host, port);
        info!(%vm_id, %host, port, "VM deployed");

        if !instance.set_status(InstanceStatus::Starting) {
            info!(%vm_id, "Instance was stopped while deploying, skipping bootstrap");
            return Ok(());
        }

        wait_for_ssh(
            &host,
            port,
            self.tuning.ssh_retries,
            self.tuning.ssh_retry_interval,
        )
        .await?;

        let metadata = AgentMetadata::new(&vm_id, image.id())
            .with_starting_instance_id(instance.starting_id());
        RemoteAgent::new(self.shell.clone(), image.agent_directory())
            .upload_metadata(&host, port, image.credentials(), &metadata)
            .await?;

        if instance.set_status(InstanceStatus::Running) {
            info!(%vm_id, "Instance is running");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(image_id = %image.id(), instance_id = %instance.id()))]
    async fn terminate(&self, image: Arc<Image>, instance: Arc<Instance>) {
        let _token = instance.acquire_job_token().await;

        let host = instance.host();
        if host.is_none() && !instance.is_legacy() {
            instance.set_status(InstanceStatus::Stopped);
            image.remove_instance(&instance.id());
            info!("Instance was never deployed, removed");
            return;
        }

        instance.set_status(InstanceStatus::ScheduledToStop);
        if let Some(host) = host {
            RemoteAgent::new(self.shell.clone(), image.agent_directory())
                .stop_agent(&host, instance.port(), image.credentials())
                .await;
        }

        instance.set_status(InstanceStatus::Stopping);
        if let Err(e) = jobs::delete_instance(self.api.as_ref(), &self.capacity, &image, &instance).await {
            jobs::note_delete_failure(&image, &instance, &e, self.tuning.max_delete_attempts);
        }
    }
}
