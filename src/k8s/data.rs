use std::time::Duration;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::runtime::watcher::Event;

use crate::k8s::scheduler::SchedulerTask;
use crate::k8s::{Controller, EventResult, METRIC_WATCHER_ERRORS};
use crate::volume::{self, ANNOTATION_PROVISIONED_BY};

/// The legacy annotation naming a claim's storage class.
const ANNOTATION_K8S_STORAGE_CLASS: &str = "volume.beta.kubernetes.io/storage-class";
/// The claim phase of claims awaiting a volume.
const PHASE_CLAIM_PENDING: &str = "Pending";
/// The volume phase of volumes whose claim has been deleted.
const PHASE_VOLUME_RELEASED: &str = "Released";
/// The reclaim policy under which released volumes are to be deleted.
const RECLAIM_POLICY_DELETE: &str = "Delete";

//////////////////////////////////////////////////////////////////////////////
// Claim Events //////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `PersistentVolumeClaim` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_claim_event(&mut self, res: EventResult<PersistentVolumeClaim>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from PersistentVolumeClaim k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS, "kind" => "claims");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.claim_applied(obj),
            Event::Deleted(_obj) => (),
            Event::Restarted(objs) => {
                for obj in objs {
                    self.claim_applied(obj);
                }
            }
        }
    }

    fn claim_applied(&mut self, claim: PersistentVolumeClaim) {
        if !needs_volume(&claim) {
            return;
        }
        self.spawn_scheduler_task(SchedulerTask::ProvisionClaim(Box::new(claim)), false);
    }
}

//////////////////////////////////////////////////////////////////////////////
// Volume Events /////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `PersistentVolume` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_volume_event(&mut self, res: EventResult<PersistentVolume>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from PersistentVolume k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS, "kind" => "volumes");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.volume_applied(obj),
            Event::Deleted(_obj) => (),
            Event::Restarted(objs) => {
                for obj in objs {
                    self.volume_applied(obj);
                }
            }
        }
    }

    fn volume_applied(&mut self, volume: PersistentVolume) {
        if !should_delete(&volume, self.provisioner.name()) {
            return;
        }
        self.spawn_scheduler_task(SchedulerTask::DeleteVolume(Box::new(volume)), false);
    }
}

//////////////////////////////////////////////////////////////////////////////
// Filters ///////////////////////////////////////////////////////////////////

/// Whether the given claim is pending and not yet bound to any volume.
pub(super) fn needs_volume(claim: &PersistentVolumeClaim) -> bool {
    if claim.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let is_pending = claim
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map(|phase| phase == PHASE_CLAIM_PENDING)
        .unwrap_or(true); // New claims may not yet have a status.
    let is_bound = claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .map(|name| !name.is_empty())
        .unwrap_or(false);
    is_pending && !is_bound && claim_storage_class(claim).is_some()
}

/// The storage class requested by the given claim.
pub(super) fn claim_storage_class(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.as_deref())
        .or_else(|| {
            claim
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(ANNOTATION_K8S_STORAGE_CLASS))
                .map(String::as_str)
        })
        .filter(|name| !name.is_empty())
}

/// The name of the volume to be provisioned for the given claim.
pub(super) fn volume_name_for_claim(claim: &PersistentVolumeClaim) -> Option<String> {
    claim
        .metadata
        .uid
        .as_deref()
        .filter(|uid| !uid.is_empty())
        .map(|uid| format!("pvc-{}", uid))
}

/// Whether the given volume was created by the named provisioner and is released for deletion.
pub(super) fn should_delete(volume: &PersistentVolume, provisioner_name: &str) -> bool {
    if volume.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let is_ours = volume::annotation(volume, ANNOTATION_PROVISIONED_BY)
        .map(|name| name == provisioner_name)
        .unwrap_or(false);
    let is_released = volume
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map(|phase| phase == PHASE_VOLUME_RELEASED)
        .unwrap_or(false);
    let reclaims_by_delete = volume
        .spec
        .as_ref()
        .and_then(|spec| spec.persistent_volume_reclaim_policy.as_deref())
        .map(|policy| policy == RECLAIM_POLICY_DELETE)
        .unwrap_or(false);
    is_ours && is_released && reclaims_by_delete
}
