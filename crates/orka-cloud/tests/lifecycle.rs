use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use orka_client::{
    ApiError, ClientError, DeletionResponse, DeploymentResponse, NodesResponse, OrkaNode,
    OrkaVmConfig, VmApi, VmInstance, VmResponse,
};
use orka_cloud::config::{ImageConfig, Tuning};
use orka_cloud::{
    CloudClient, CloudError, Image, InstanceLimit, InstanceStatus, LegacyInstanceStore,
    ProfileConfig, RemoteShell, SshCredentials, SshError, TokenSource,
};
use orka_common::{AgentDescription, METADATA_REMOTE_PATH};
use tokio::net::TcpListener;
use tokio::sync::Notify;

const PROFILE: &str = "prof1";
const IMAGE_ID: &str = "prof1_build-mac";

/// In-memory Orka cluster.
struct FakeOrka {
    reported_ip: String,
    ssh_port: u16,
    has_capacity: AtomicBool,
    deploy_error: Mutex<Option<String>>,
    refuse_delete: AtomicBool,
    lose_deployed: AtomicBool,
    hold_deploys: AtomicBool,
    deploy_started: Notify,
    release_deploy: Notify,
    next_vm: AtomicUsize,
    deploy_names: Mutex<Vec<String>>,
    deploy_metadata: Mutex<Vec<HashMap<String, String>>>,
    running: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeOrka {
    fn new(reported_ip: &str, ssh_port: u16) -> Arc<Self> {
        Arc::new(Self {
            reported_ip: reported_ip.to_string(),
            ssh_port,
            has_capacity: AtomicBool::new(true),
            deploy_error: Mutex::new(None),
            refuse_delete: AtomicBool::new(false),
            lose_deployed: AtomicBool::new(false),
            hold_deploys: AtomicBool::new(false),
            deploy_started: Notify::new(),
            release_deploy: Notify::new(),
            next_vm: AtomicUsize::new(1),
            deploy_names: Mutex::new(Vec::new()),
            deploy_metadata: Mutex::new(Vec::new()),
            running: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        })
    }

    fn deploy_count(&self) -> usize {
        self.deploy_metadata.lock().unwrap().len()
    }
}

#[async_trait]
impl VmApi for FakeOrka {
    async fn deploy(
        &self,
        name: &str,
        _template: &str,
        metadata: &HashMap<String, String>,
    ) -> orka_client::Result<DeploymentResponse> {
        self.deploy_names.lock().unwrap().push(name.to_string());
        self.deploy_metadata.lock().unwrap().push(metadata.clone());
        if self.hold_deploys.load(Ordering::SeqCst) {
            self.deploy_started.notify_one();
            self.release_deploy.notified().await;
        }
        if let Some(message) = self.deploy_error.lock().unwrap().clone() {
            return Ok(DeploymentResponse {
                errors: vec![ApiError { message }],
                ..Default::default()
            });
        }
        let name = format!("vm-{}", self.next_vm.fetch_add(1, Ordering::SeqCst));
        if !self.lose_deployed.load(Ordering::SeqCst) {
            self.running.lock().unwrap().push(name.clone());
        }
        Ok(DeploymentResponse {
            name,
            ip: self.reported_ip.clone(),
            ssh_port: self.ssh_port,
            ..Default::default()
        })
    }

    async fn get_vm(&self, _name: &str) -> orka_client::Result<VmResponse> {
        Ok(VmResponse {
            instances: self
                .running
                .lock()
                .unwrap()
                .iter()
                .map(|name| VmInstance {
                    name: name.clone(),
                    ..Default::default()
                })
                .collect(),
            errors: vec![],
        })
    }

    async fn delete_vm(&self, id: &str) -> orka_client::Result<DeletionResponse> {
        if self.refuse_delete.load(Ordering::SeqCst) {
            return Err(ClientError::Api {
                status: 500,
                message: "node is unreachable".to_string(),
            });
        }
        self.running.lock().unwrap().retain(|vm| vm != id);
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(DeletionResponse::default())
    }

    async fn list_nodes(&self) -> orka_client::Result<NodesResponse> {
        let available_cpu = if self.has_capacity.load(Ordering::SeqCst) {
            12
        } else {
            0
        };
        Ok(NodesResponse {
            items: vec![OrkaNode {
                name: "mini-1".to_string(),
                phase: "Ready".to_string(),
                available_cpu,
                available_memory: "32Gi".to_string(),
                ..Default::default()
            }],
            errors: vec![],
        })
    }

    async fn vm_config(&self, template: &str) -> orka_client::Result<Option<OrkaVmConfig>> {
        Ok(Some(OrkaVmConfig {
            name: template.to_string(),
            cpu: 3,
            memory: Some("8G".to_string()),
            ..Default::default()
        }))
    }
}

/// Records what would have been sent over SSH.
#[derive(Default)]
struct RecordingShell {
    uploads: Mutex<Vec<(String, u16, String, String)>>,
    commands: Mutex<Vec<String>>,
}

#[async_trait]
impl RemoteShell for RecordingShell {
    async fn upload(
        &self,
        host: &str,
        port: u16,
        _credentials: &SshCredentials,
        local: &Path,
        remote: &str,
    ) -> Result<(), SshError> {
        let contents = std::fs::read_to_string(local)?;
        self.uploads
            .lock()
            .unwrap()
            .push((host.to_string(), port, remote.to_string(), contents));
        Ok(())
    }

    async fn exec(
        &self,
        _host: &str,
        _port: u16,
        _credentials: &SshCredentials,
        command: &str,
    ) -> Result<String, SshError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(String::new())
    }
}

struct Harness {
    client: CloudClient,
    cluster: Arc<FakeOrka>,
    shell: Arc<RecordingShell>,
    store: Arc<LegacyInstanceStore>,
    _ssh: Option<TcpListener>,
}

impl Harness {
    fn image(&self) -> Arc<Image> {
        self.client.find_image_by_id(IMAGE_ID).expect("image exists")
    }
}

fn quick_tuning() -> Tuning {
    Tuning {
        ssh_retries: 2,
        ssh_retry_interval: Duration::from_millis(10),
        reconcile_initial_delay: Duration::from_secs(3600),
        reconcile_interval: Duration::from_secs(3600),
        graceful_initial_delay: Duration::from_secs(3600),
        graceful_interval: Duration::from_secs(3600),
        shutdown_drain: Duration::from_secs(1),
        ..Default::default()
    }
}

fn profile(limit: InstanceLimit, tuning: Tuning) -> ProfileConfig {
    ProfileConfig {
        profile_id: PROFILE.to_string(),
        profile_name: "Mac builds".to_string(),
        endpoint: "http://orka.local".to_string(),
        namespace: "orka-default".to_string(),
        token_source: TokenSource::Static("token".to_string()),
        node_mappings: HashMap::from([("node-a".to_string(), "127.0.0.1".to_string())]),
        images: vec![ImageConfig {
            template: "build-mac".to_string(),
            credentials: SshCredentials::new("admin", "admin"),
            agent_directory: "/opt/agent".to_string(),
            instance_limit: limit,
            vm_metadata: HashMap::from([
                ("team".to_string(), "ios".to_string()),
                ("target_project".to_string(), "iOS App".to_string()),
            ]),
            agent_pool_id: None,
        }],
        tuning,
    }
}

/// Client whose VMs report `Node-A` and listen on a live local port.
async fn harness(limit: InstanceLimit, tuning: Tuning) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cluster = FakeOrka::new("Node-A", port);
    let mut harness = harness_with(cluster, limit, tuning, Arc::new(LegacyInstanceStore::new()));
    harness._ssh = Some(listener);
    harness
}

fn harness_with(
    cluster: Arc<FakeOrka>,
    limit: InstanceLimit,
    tuning: Tuning,
    store: Arc<LegacyInstanceStore>,
) -> Harness {
    let shell = Arc::new(RecordingShell::default());
    let client = CloudClient::new(
        profile(limit, tuning),
        cluster.clone(),
        shell.clone(),
        store.clone(),
    )
    .unwrap();
    Harness {
        client,
        cluster,
        shell,
        store,
        _ssh: None,
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn instance_reaches_running_under_vm_id() -> anyhow::Result<()> {
    let h = harness(InstanceLimit::Unlimited, quick_tuning()).await;
    let image = h.image();

    let instance = h.client.start_new_instance(&image)?;
    let placeholder = instance.starting_id().to_string();
    assert_eq!(instance.status(), InstanceStatus::ScheduledToStart);

    eventually("running", || instance.status() == InstanceStatus::Running).await;

    assert_eq!(instance.id(), "vm-1");
    assert!(h.client.find_instance_by_id(IMAGE_ID, &placeholder).is_none());
    let found = h.client.find_instance_by_id(IMAGE_ID, "vm-1").unwrap();
    assert!(Arc::ptr_eq(&found, &instance));
    assert_eq!(instance.host().as_deref(), Some("127.0.0.1"));
    assert!(instance.error_info().is_none());

    let metadata = h.cluster.deploy_metadata.lock().unwrap()[0].clone();
    assert_eq!(metadata["tc_profile_id"], PROFILE);
    assert_eq!(metadata["tc_image_id"], IMAGE_ID);
    assert_eq!(metadata["team"], "ios");
    let name = h.cluster.deploy_names.lock().unwrap()[0].clone();
    assert!(name.starts_with("ios-app-tc-"), "unexpected VM name {name}");
    assert_eq!(name.len(), "ios-app-tc-".len() + 5);

    let uploads = h.shell.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    let (host, _, remote, contents) = &uploads[0];
    assert_eq!(host, "127.0.0.1");
    assert_eq!(remote, METADATA_REMOTE_PATH);
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines, ["vm-1", IMAGE_ID, placeholder.as_str()]);

    h.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn limit_rejects_then_frees_slot_after_termination() -> anyhow::Result<()> {
    let h = harness(InstanceLimit::Max(2), quick_tuning()).await;
    let image = h.image();

    let first = h.client.start_new_instance(&image)?;
    let second = h.client.start_new_instance(&image)?;
    assert!(!h.client.can_start_new_instance(&image));
    match h.client.start_new_instance(&image) {
        Err(CloudError::Quota(message)) => {
            assert_eq!(message, "Maximum number of instances already launched.")
        }
        other => panic!("expected quota error, got {:?}", other.map(|i| i.id())),
    }

    eventually("both running", || {
        first.status() == InstanceStatus::Running && second.status() == InstanceStatus::Running
    })
    .await;

    h.client.terminate_instance(&first)?;
    eventually("first removed", || image.instances().len() == 1).await;
    assert_eq!(first.status(), InstanceStatus::Stopped);
    assert_eq!(h.cluster.deleted.lock().unwrap().as_slice(), [first.id()]);
    assert_eq!(
        h.shell.commands.lock().unwrap().as_slice(),
        ["/opt/agent/bin/agent.sh stop".to_string()]
    );

    assert!(h.client.can_start_new_instance(&image));
    h.client.start_new_instance(&image)?;

    h.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn unreachable_ssh_fails_instance_and_reconciliation_deletes_it() -> anyhow::Result<()> {
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };
    let tuning = Tuning {
        reconcile_initial_delay: Duration::from_millis(300),
        reconcile_interval: Duration::from_millis(100),
        ..quick_tuning()
    };
    let h = harness_with(
        FakeOrka::new("node-a", closed_port),
        InstanceLimit::Unlimited,
        tuning,
        Arc::new(LegacyInstanceStore::new()),
    );
    let image = h.image();

    let instance = h.client.start_new_instance(&image)?;
    eventually("error info", || instance.error_info().is_some()).await;

    assert_eq!(instance.status(), InstanceStatus::Starting);
    assert!(instance.is_marked_for_termination());
    assert_eq!(instance.error_info().unwrap().message, "SSH bootstrap failed");
    assert!(h.shell.uploads.lock().unwrap().is_empty());

    eventually("reconciled", || image.instances().is_empty()).await;
    assert_eq!(h.cluster.deleted.lock().unwrap().as_slice(), ["vm-1".to_string()]);

    h.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn deploy_capacity_error_starts_backoff() -> anyhow::Result<()> {
    let h = harness(InstanceLimit::Unlimited, quick_tuning()).await;
    *h.cluster.deploy_error.lock().unwrap() = Some("Cannot deploy more than 2 VMs".to_string());
    let image = h.image();

    let instance = h.client.start_new_instance(&image)?;
    eventually("deploy failure", || instance.error_info().is_some()).await;
    assert_eq!(instance.status(), InstanceStatus::ScheduledToStart);

    let client_error = h.client.error_info().expect("backoff is reported");
    assert!(client_error.details.unwrap().contains("Cannot deploy more than 2 VMs"));
    assert!(!h.client.can_start_new_instance(&image));
    assert!(matches!(
        h.client.start_new_instance(&image),
        Err(CloudError::Capacity(_))
    ));
    assert_eq!(h.cluster.deploy_count(), 1);

    h.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn probe_without_capacity_blocks_deploy() -> anyhow::Result<()> {
    let h = harness(InstanceLimit::Unlimited, quick_tuning()).await;
    h.cluster.has_capacity.store(false, Ordering::SeqCst);
    let image = h.image();

    let instance = h.client.start_new_instance(&image)?;
    eventually("capacity failure", || instance.error_info().is_some()).await;

    assert_eq!(instance.error_info().unwrap().message, "Capacity unavailable");
    assert_eq!(h.cluster.deploy_count(), 0);
    assert!(matches!(
        h.client.start_new_instance(&image),
        Err(CloudError::Capacity(_))
    ));

    h.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn failed_delete_is_recorded_and_retried() -> anyhow::Result<()> {
    let h = harness(InstanceLimit::Unlimited, quick_tuning()).await;
    let image = h.image();
    let instance = h.client.start_new_instance(&image)?;
    eventually("running", || instance.status() == InstanceStatus::Running).await;

    h.cluster.refuse_delete.store(true, Ordering::SeqCst);
    h.client.terminate_instance(&instance)?;
    eventually("delete failure", || instance.delete_failures() == 1).await;

    assert_eq!(instance.status(), InstanceStatus::Error);
    assert!(instance.is_marked_for_termination());
    assert!(h.client.find_instance_by_id(IMAGE_ID, "vm-1").is_some());

    h.cluster.refuse_delete.store(false, Ordering::SeqCst);
    h.client.terminate_instance(&instance)?;
    eventually("deleted", || image.instances().is_empty()).await;
    assert_eq!(instance.status(), InstanceStatus::Stopped);

    h.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn agents_are_matched_by_instance_and_image() -> anyhow::Result<()> {
    let h = harness(InstanceLimit::Unlimited, quick_tuning()).await;
    let image = h.image();
    let instance = h.client.start_new_instance(&image)?;
    eventually("running", || instance.status() == InstanceStatus::Running).await;

    assert!(h
        .client
        .find_instance_by_agent(&AgentDescription::new("vm-1", "prof2_build-mac"))
        .is_none());
    assert!(h
        .client
        .find_instance_by_agent(&AgentDescription::default())
        .is_none());
    assert!(!instance.is_agent_connected());

    let found = h
        .client
        .find_instance_by_agent(&AgentDescription::new("vm-1", IMAGE_ID))
        .unwrap();
    assert!(Arc::ptr_eq(&found, &instance));
    assert!(instance.is_agent_connected());

    h.client.restart_instance(&instance);
    assert_eq!(instance.status(), InstanceStatus::Running);

    h.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn disposed_instances_are_adopted_and_retired() -> anyhow::Result<()> {
    let h = harness(InstanceLimit::Max(1), quick_tuning()).await;
    let old_image = h.image();
    let instance = h.client.start_new_instance(&old_image)?;
    eventually("running", || instance.status() == InstanceStatus::Running).await;

    h.client.dispose().await;
    assert!(h.client.images().is_empty());
    assert_eq!(h.store.instance_count(PROFILE), 1);
    assert!(h.client.start_new_instance(&old_image).is_err());

    let tuning = Tuning {
        graceful_initial_delay: Duration::from_millis(200),
        graceful_interval: Duration::from_millis(100),
        ..quick_tuning()
    };
    let next = harness_with(h.cluster.clone(), InstanceLimit::Max(1), tuning, h.store.clone());
    assert!(!h.store.has_instances(PROFILE));

    let image = next.image();
    let adopted = image.find_instance("vm-1").expect("legacy instance adopted");
    assert!(adopted.is_legacy());
    assert_eq!(adopted.status(), InstanceStatus::Running);
    assert!(next.client.can_start_new_instance(&image));

    let found = next
        .client
        .find_instance_by_agent(&AgentDescription::new("vm-1", IMAGE_ID))
        .unwrap();
    assert!(Arc::ptr_eq(&found, &adopted));

    eventually("retired", || adopted.status() == InstanceStatus::ScheduledToStop).await;
    assert!(adopted.is_marked_for_termination());
    assert!(!adopted.legacy().unwrap().is_pending_shutdown());

    next.client.terminate_instance(&adopted)?;
    eventually("legacy deleted", || image.instances().is_empty()).await;
    assert!(h.cluster.deleted.lock().unwrap().contains(&"vm-1".to_string()));

    next.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn host_remapping_is_case_insensitive() {
    let h = harness(InstanceLimit::Unlimited, quick_tuning()).await;
    assert_eq!(h.client.remap_host("NODE-A"), "127.0.0.1");
    assert_eq!(h.client.remap_host("node-b"), "node-b");
    h.client.dispose().await;
}

#[tokio::test]
async fn missing_images_or_token_are_rejected() {
    let mut config = profile(InstanceLimit::Unlimited, quick_tuning());
    config.token_source = TokenSource::Static(String::new());
    assert!(matches!(
        CloudClient::from_config(config, Arc::new(LegacyInstanceStore::new())),
        Err(CloudError::Config(_))
    ));

    let mut config = profile(InstanceLimit::Unlimited, quick_tuning());
    config.images.clear();
    let result = CloudClient::new(
        config,
        FakeOrka::new("node-a", 22),
        Arc::new(RecordingShell::default()),
        Arc::new(LegacyInstanceStore::new()),
    );
    assert!(matches!(result, Err(CloudError::Config(_))));
}

#[tokio::test]
async fn terminate_before_deploy_removes_instance_without_vm() -> anyhow::Result<()> {
    let h = harness(InstanceLimit::Max(1), quick_tuning()).await;
    let image = h.image();

    let instance = h.client.start_new_instance(&image)?;
    h.client.terminate_instance(&instance)?;
    assert_eq!(instance.status(), InstanceStatus::ScheduledToStop);

    eventually("removed", || image.instances().is_empty()).await;
    assert_eq!(instance.status(), InstanceStatus::Stopped);
    assert_eq!(h.cluster.deploy_count(), 0);
    assert!(h.cluster.running.lock().unwrap().is_empty());
    assert!(h.cluster.deleted.lock().unwrap().is_empty());
    assert!(h.shell.commands.lock().unwrap().is_empty());
    assert!(h.client.can_start_new_instance(&image));

    h.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn terminate_during_deploy_skips_bootstrap_and_deletes_vm() -> anyhow::Result<()> {
    let h = harness(InstanceLimit::Unlimited, quick_tuning()).await;
    h.cluster.hold_deploys.store(true, Ordering::SeqCst);
    let image = h.image();

    let instance = h.client.start_new_instance(&image)?;
    tokio::time::timeout(Duration::from_secs(10), h.cluster.deploy_started.notified()).await?;
    h.client.terminate_instance(&instance)?;
    h.cluster.release_deploy.notify_one();

    eventually("deleted", || image.instances().is_empty()).await;
    assert_eq!(instance.status(), InstanceStatus::Stopped);
    assert_eq!(instance.id(), "vm-1");
    assert_eq!(h.cluster.deleted.lock().unwrap().as_slice(), ["vm-1".to_string()]);
    assert!(h.cluster.running.lock().unwrap().is_empty());
    assert!(h.shell.uploads.lock().unwrap().is_empty());

    h.client.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_then_terminate_never_leaks_vms() -> anyhow::Result<()> {
    let h = harness(InstanceLimit::Unlimited, quick_tuning()).await;
    let image = h.image();

    let mut instances = Vec::new();
    for _ in 0..50 {
        let instance = h.client.start_new_instance(&image)?;
        h.client.terminate_instance(&instance)?;
        instances.push(instance);
    }

    eventually("all removed", || image.instances().is_empty()).await;
    assert!(instances
        .iter()
        .all(|i| i.status() == InstanceStatus::Stopped));
    let running = h.cluster.running.lock().unwrap().clone();
    assert!(running.is_empty(), "leaked VMs: {running:?}");
    assert_eq!(
        h.cluster.deleted.lock().unwrap().len(),
        h.cluster.deploy_count()
    );

    h.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn repeated_terminate_stops_and_deletes_once() -> anyhow::Result<()> {
    let h = harness(InstanceLimit::Unlimited, quick_tuning()).await;
    let image = h.image();
    let instance = h.client.start_new_instance(&image)?;
    eventually("running", || instance.status() == InstanceStatus::Running).await;

    h.client.terminate_instance(&instance)?;
    h.client.terminate_instance(&instance)?;
    assert!(instance.is_termination_queued());

    eventually("deleted", || image.instances().is_empty()).await;
    h.client.terminate_instance(&instance)?;
    assert_eq!(instance.status(), InstanceStatus::Stopped);
    assert_eq!(h.shell.commands.lock().unwrap().len(), 1);
    assert_eq!(h.cluster.deleted.lock().unwrap().as_slice(), ["vm-1".to_string()]);
    assert!(instance.error_info().is_none());

    h.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn zero_ssh_port_falls_back_to_22() -> anyhow::Result<()> {
    let h = harness_with(
        FakeOrka::new("node-a", 0),
        InstanceLimit::Unlimited,
        quick_tuning(),
        Arc::new(LegacyInstanceStore::new()),
    );
    let image = h.image();

    let instance = h.client.start_new_instance(&image)?;
    eventually("endpoint", || instance.host().is_some()).await;
    assert_eq!(instance.host().as_deref(), Some("127.0.0.1"));
    assert_eq!(instance.port(), 22);

    h.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn vm_missing_after_deploy_drops_instance() -> anyhow::Result<()> {
    let h = harness(InstanceLimit::Max(1), quick_tuning()).await;
    h.cluster.lose_deployed.store(true, Ordering::SeqCst);
    let image = h.image();

    let instance = h.client.start_new_instance(&image)?;
    eventually("dropped", || image.instances().is_empty()).await;

    assert_eq!(instance.status(), InstanceStatus::Stopped);
    assert_eq!(h.cluster.deploy_count(), 1);
    assert!(instance.host().is_none());
    assert!(h.shell.uploads.lock().unwrap().is_empty());
    assert!(h.client.can_start_new_instance(&image));

    h.client.dispose().await;
    Ok(())
}
