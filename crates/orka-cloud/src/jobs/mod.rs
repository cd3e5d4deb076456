//! Periodic maintenance and the VM deletion step shared with termination.

pub mod graceful;
pub mod reconcile;

use orka_client::VmApi;
use tracing::{error, info, warn};

use crate::capacity::CapacityGate;
use crate::image::Image;
use crate::instance::Instance;
use crate::status::InstanceStatus;
use crate::{CloudError, ErrorInfo, Result};

/// Deletes the VM behind `instance`; on success marks it stopped and drops it from `image`.
pub(crate) async fn delete_instance(
    api: &dyn VmApi,
    capacity: &CapacityGate,
    image: &Image,
    instance: &Instance,
) -> Result<()> {
    let id = instance.id();
    let response = api.delete_vm(&id).await?;
    if !response.is_success() {
        return Err(CloudError::Deletion(response.error_message()));
    }

    capacity.clear_backoff();
    instance.set_status(InstanceStatus::Stopped);
    image.remove_instance(&id);
    info!(instance_id = %id, image_id = %image.id(), "VM deleted");
    Ok(())
}

/// Records a failed delete on the instance and escalates once `max_attempts` is reached.
pub(crate) fn note_delete_failure(
    image: &Image,
    instance: &Instance,
    err: &CloudError,
    max_attempts: u32,
) {
    let attempts = instance.record_delete_failure();
    instance.set_status(InstanceStatus::Error);
    instance.fail(ErrorInfo::from(err));
    instance.clear_termination_queued();

    let id = instance.id();
    if attempts >= max_attempts {
        error!(instance_id = %id, image_id = %image.id(), attempts, error = %err, "VM still not deleted, needs attention");
        image.set_error_info(Some(
            ErrorInfo::new(format!(
                "Instance {id} could not be deleted after {attempts} attempts"
            ))
            .with_details(err.to_string()),
        ));
    } else {
        warn!(instance_id = %id, attempts, error = %err, "VM delete failed, will retry");
    }
}
