use std::sync::Arc;

use tracing::{debug, info};

use crate::image::Image;
use crate::status::InstanceStatus;

/// Flags running legacy instances for termination once; settles the rest.
///
/// Running instances move to SCHEDULED_TO_STOP and are marked for termination,
/// leaving the actual stop to the orchestrator once the agent is idle.
/// Returns how many instances were scheduled.
pub fn retire_legacy_instances(images: &[Arc<Image>]) -> usize {
    let mut scheduled = 0;

    for image in images {
        for instance in image.legacy_instances() {
            let Some(legacy) = instance.legacy() else {
                continue;
            };
            if !legacy.is_pending_shutdown() || instance.is_marked_for_termination() {
                continue;
            }

            let status = instance.status();
            match status {
                InstanceStatus::Running => {
                    if instance.set_status(InstanceStatus::ScheduledToStop) {
                        legacy.clear_pending_shutdown();
                        instance.set_marked_for_termination(true);
                        scheduled += 1;
                        info!(instance_id = %instance.id(), image_id = %image.id(), "Scheduled legacy instance for shutdown");
                    }
                }
                s if s.is_stopping_or_stopped() => {
                    legacy.clear_pending_shutdown();
                    debug!(instance_id = %instance.id(), status = %s, "Legacy instance already stopping");
                }
                _ => {}
            }
        }
    }

    scheduled
}
