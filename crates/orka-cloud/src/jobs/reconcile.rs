use std::collections::HashSet;
use std::sync::Arc;

use orka_client::VmApi;
use tracing::{debug, info, instrument, warn};

use super::{delete_instance, note_delete_failure};
use crate::capacity::CapacityGate;
use crate::image::Image;
use crate::status::InstanceStatus;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub deleted: usize,
    pub dropped: usize,
    pub failed: usize,
    pub skipped_busy: usize,
}

/// Cleans up instances that failed and were marked for termination.
///
/// Instances whose VM still exists are deleted; the rest are dropped from
/// their image. A failure on one instance never stops the batch.
#[instrument(skip_all)]
pub async fn remove_failed_instances(
    images: &[Arc<Image>],
    api: &dyn VmApi,
    capacity: &CapacityGate,
    max_delete_attempts: u32,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for image in images {
        let failed: Vec<_> = image
            .instances()
            .into_iter()
            .filter(|i| i.is_marked_for_termination() && i.error_info().is_some())
            .collect();
        if failed.is_empty() {
            continue;
        }

        let running: HashSet<String> = match api.get_vm(image.template()).await {
            Ok(vms) => vms.instances.into_iter().map(|vm| vm.name).collect(),
            Err(e) => {
                warn!(image_id = %image.id(), error = %e, "Could not list VMs, skipping image");
                report.failed += failed.len();
                continue;
            }
        };

        for instance in failed {
            let Some(_token) = instance.try_acquire_job_token() else {
                debug!(instance_id = %instance.id(), "Instance busy, retrying next round");
                report.skipped_busy += 1;
                continue;
            };

            let id = instance.id();
            if !running.contains(&id) {
                image.remove_instance(&id);
                report.dropped += 1;
                info!(instance_id = %id, image_id = %image.id(), "Removed failed instance without a VM");
                continue;
            }

            instance.set_status(InstanceStatus::ScheduledToStop);
            instance.set_status(InstanceStatus::Stopping);
            match delete_instance(api, capacity, image, &instance).await {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    note_delete_failure(image, &instance, &e, max_delete_attempts);
                    report.failed += 1;
                }
            }
        }
    }

    if report != ReconcileReport::default() {
        info!(?report, "Failed instance reconciliation finished");
    }
    report
}
