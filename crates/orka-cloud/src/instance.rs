use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::persisted::PersistedInstanceData;
use crate::status::InstanceStatus;
use crate::ErrorInfo;

/// Extra state of an instance carried over from a previous controller.
#[derive(Debug)]
pub struct LegacyMeta {
    pub original_image_id: String,
    pending_shutdown: AtomicBool,
}

impl LegacyMeta {
    pub fn new(original_image_id: impl Into<String>) -> Self {
        Self {
            original_image_id: original_image_id.into(),
            pending_shutdown: AtomicBool::new(true),
        }
    }

    pub fn is_pending_shutdown(&self) -> bool {
        self.pending_shutdown.load(Ordering::SeqCst)
    }

    pub fn clear_pending_shutdown(&self) {
        self.pending_shutdown.store(false, Ordering::SeqCst);
    }
}

/// Place in the instance's job queue, taken when a job is scheduled.
#[derive(Debug)]
pub struct JobTurn {
    previous: Option<oneshot::Receiver<()>>,
}

impl JobTurn {
    /// Resolves once every job queued before this one has finished.
    pub async fn wait(self) {
        if let Some(previous) = self.previous {
            let _ = previous.await;
        }
    }
}

/// Held by a running job. Dropping it lets the next queued job start.
#[derive(Debug)]
pub struct JobDone {
    _done: oneshot::Sender<()>,
}

#[derive(Debug)]
struct InstanceState {
    status: InstanceStatus,
    host: Option<String>,
    port: u16,
    error: Option<ErrorInfo>,
}

/// One VM tracked through its lifecycle.
///
/// The id starts out as a local placeholder and is replaced with the VM id
/// once the deploy succeeds, through [`Image::rekey_instance`](crate::Image::rekey_instance).
/// Jobs run in the order they were [queued](Self::queue_job) and hold the
/// [`job token`](Self::acquire_job_token) while they touch the instance.
#[derive(Debug)]
pub struct Instance {
    id: RwLock<String>,
    starting_id: String,
    image_id: String,
    namespace: String,
    start_time: DateTime<Utc>,
    state: RwLock<InstanceState>,
    marked_for_termination: AtomicBool,
    agent_connected: AtomicBool,
    termination_queued: AtomicBool,
    delete_failures: AtomicU32,
    legacy: Option<LegacyMeta>,
    job_token: Arc<Mutex<()>>,
    last_job: std::sync::Mutex<Option<oneshot::Receiver<()>>>,
}

impl Instance {
    pub fn new(id: impl Into<String>, image_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            starting_id: id.clone(),
            id: RwLock::new(id),
            image_id: image_id.into(),
            namespace: namespace.into(),
            start_time: Utc::now(),
            state: RwLock::new(InstanceState {
                status: InstanceStatus::ScheduledToStart,
                host: None,
                port: 0,
                error: None,
            }),
            marked_for_termination: AtomicBool::new(false),
            agent_connected: AtomicBool::new(false),
            termination_queued: AtomicBool::new(false),
            delete_failures: AtomicU32::new(0),
            legacy: None,
            job_token: Arc::new(Mutex::new(())),
            last_job: std::sync::Mutex::new(None),
        }
    }

    /// Rebuilds a legacy instance from a snapshot. It is assumed to be running.
    pub fn from_legacy_snapshot(data: &PersistedInstanceData) -> Self {
        let mut instance = Self::new(&data.instance_id, &data.image_id, &data.namespace);
        {
            let state = instance.state.get_mut().unwrap_or_else(PoisonError::into_inner);
            state.status = InstanceStatus::Running;
            state.host = (!data.host.is_empty()).then(|| data.host.clone());
            state.port = data.port;
        }
        let original = data
            .original_image_id
            .clone()
            .unwrap_or_else(|| data.image_id.clone());
        instance.legacy = Some(LegacyMeta::new(original));
        instance
    }

    fn read(&self) -> RwLockReadGuard<'_, InstanceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InstanceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> String {
        self.id.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_id(&self, new_id: &str) {
        *self.id.write().unwrap_or_else(PoisonError::into_inner) = new_id.to_string();
    }

    /// The placeholder id the instance was created under.
    pub fn starting_id(&self) -> &str {
        &self.starting_id
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn status(&self) -> InstanceStatus {
        self.read().status
    }

    /// Moves to `next` if the transition is legal. Returns whether it happened.
    pub fn set_status(&self, next: InstanceStatus) -> bool {
        let mut state = self.write();
        if state.status == next {
            return true;
        }
        if !state.status.can_transition_to(next) {
            warn!(instance_id = %self.id(), from = %state.status, to = %next, "Ignoring illegal status transition");
            return false;
        }
        debug!(instance_id = %self.id(), from = %state.status, to = %next, "Instance status changed");
        state.status = next;
        true
    }

    pub fn host(&self) -> Option<String> {
        self.read().host.clone()
    }

    pub fn port(&self) -> u16 {
        self.read().port
    }

    pub fn set_endpoint(&self, host: impl Into<String>, port: u16) {
        let mut state = self.write();
        state.host = Some(host.into());
        state.port = port;
    }

    pub fn error_info(&self) -> Option<ErrorInfo> {
        self.read().error.clone()
    }

    pub fn set_error_info(&self, error: ErrorInfo) {
        self.write().error = Some(error);
    }

    pub fn is_marked_for_termination(&self) -> bool {
        self.marked_for_termination.load(Ordering::SeqCst)
    }

    pub fn set_marked_for_termination(&self, marked: bool) {
        self.marked_for_termination.store(marked, Ordering::SeqCst);
    }

    /// Records a failure: error info plus the termination mark reconciliation looks for.
    pub fn fail(&self, error: ErrorInfo) {
        warn!(instance_id = %self.id(), message = %error.message, details = ?error.details, "Instance failed");
        self.set_error_info(error);
        self.set_marked_for_termination(true);
    }

    pub fn is_agent_connected(&self) -> bool {
        self.agent_connected.load(Ordering::SeqCst)
    }

    /// Returns `true` only for the first call.
    pub fn mark_agent_connected(&self) -> bool {
        let first = !self.agent_connected.swap(true, Ordering::SeqCst);
        if first {
            info!(instance_id = %self.id(), "Build agent connected");
        }
        first
    }

    pub fn legacy(&self) -> Option<&LegacyMeta> {
        self.legacy.as_ref()
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy.is_some()
    }

    /// Whether an agent reporting `(instance_id, image_id)` runs on this instance.
    pub fn matches_agent(&self, instance_id: &str, image_id: &str) -> bool {
        if *self.id.read().unwrap_or_else(PoisonError::into_inner) != instance_id {
            return false;
        }
        self.image_id == image_id
            || self
                .legacy
                .as_ref()
                .map_or(false, |l| l.original_image_id == image_id)
    }

    pub fn is_termination_queued(&self) -> bool {
        self.termination_queued.load(Ordering::SeqCst)
    }

    /// Returns `false` if a termination was already queued.
    pub(crate) fn queue_termination(&self) -> bool {
        !self.termination_queued.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_termination_queued(&self) {
        self.termination_queued.store(false, Ordering::SeqCst);
    }

    pub fn delete_failures(&self) -> u32 {
        self.delete_failures.load(Ordering::SeqCst)
    }

    pub(crate) fn record_delete_failure(&self) -> u32 {
        self.delete_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Appends a job to the instance's queue.
    ///
    /// The job waits on the [`JobTurn`] before running and keeps [`JobDone`]
    /// alive until it has finished.
    pub fn queue_job(&self) -> (JobTurn, JobDone) {
        let (done, finished) = oneshot::channel();
        let previous = self
            .last_job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(finished);
        (JobTurn { previous }, JobDone { _done: done })
    }

    /// Waits for the instance to be free of other jobs.
    pub async fn acquire_job_token(&self) -> OwnedMutexGuard<()> {
        self.job_token.clone().lock_owned().await
    }

    /// Takes the job token only if no job is running.
    pub fn try_acquire_job_token(&self) -> Option<OwnedMutexGuard<()>> {
        self.job_token.clone().try_lock_owned().ok()
    }

    pub fn to_persisted(&self) -> PersistedInstanceData {
        let state = self.read();
        PersistedInstanceData {
            instance_id: self.id(),
            image_id: self.image_id.clone(),
            namespace: self.namespace.clone(),
            host: state.host.clone().unwrap_or_default(),
            port: state.port,
            is_legacy: self.is_legacy(),
            original_image_id: self.legacy.as_ref().map(|l| l.original_image_id.clone()),
        }
    }
}
