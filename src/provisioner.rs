//! The provisioning coordinator.
//!
//! Drives the two volume lifecycle operations. Each call is an independent run driven entirely
//! by its inputs; nothing is kept between calls.
//!
//! ## Provision
//! 1. Validate the claim.
//! 2. Create the local volume directory. Nothing is sent to the decision-maker if this fails.
//! 3. Publish a placement request and wait for the matching response.
//! 4. Record the assignment on the chosen node. A vanished node is only warned about.
//! 5. Build the volume descriptor, tagged with the chosen node.
//!
//! A caller which records the built descriptor elsewhere uses `provision_with`, which tears the
//! volume down again if recording it fails.
//!
//! ## Delete
//! 1. Check the volume was created by this instance and extract its node and claim tags.
//! 2. Erase the assignment from the node.
//! 3. Remove the local volume directory, best-effort.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim};
use tokio::sync::broadcast;

use crate::config::Config;
use crate::error::{ProvisionError, ProvisionResult};
use crate::ledger::{Ledger, NodeStore};
use crate::placement::PlacementChannel;
use crate::volume::{self, VolumeParams, ANNOTATION_CLAIM, ANNOTATION_IDENTITY, ANNOTATION_NODE};

pub const METRIC_PROVISION_RESULTS: &str = "vcd_provisioner_provision_results";
pub const METRIC_DELETE_RESULTS: &str = "vcd_provisioner_delete_results";

/// The namespace of objects which do not name one.
const DEFAULT_NAMESPACE: &str = "default";

/// The options of a single provisioning request.
#[derive(Clone, Debug)]
pub struct VolumeOptions {
    /// The name to give the new volume.
    pub pv_name: String,
    /// The reclaim policy of the claim's storage class.
    pub reclaim_policy: Option<String>,
    /// The claim for which a volume is to be provisioned.
    pub pvc: PersistentVolumeClaim,
}

/// A dynamic volume provisioner which places volumes through an external decision-maker.
#[derive(Clone)]
pub struct Provisioner {
    /// The identity of this instance, embedded in every volume it creates.
    identity: String,
    /// The name under which this provisioner is registered.
    name: String,
    /// The root directory of all volume directories.
    pv_dir: PathBuf,
    /// The interval between checks for a placement response.
    poll_interval: Duration,
    /// The maximum duration to wait for a placement response.
    placement_timeout: Duration,

    channel: PlacementChannel,
    ledger: Ledger,

    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl Provisioner {
    /// Create a new instance.
    pub fn new(config: &Config, store: Arc<dyn NodeStore>, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            identity: config.node_name.clone(),
            name: config.provisioner_name.clone(),
            pv_dir: config.pv_dir.clone(),
            poll_interval: config.poll_interval(),
            placement_timeout: config.placement_timeout(),
            channel: PlacementChannel::new(&config.placement_dir),
            ledger: Ledger::new(store, config.label_prefix.clone()),
            shutdown,
        }
    }

    /// The name under which this provisioner is registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prepare the local directories used by this provisioner.
    pub async fn init(&self) -> ProvisionResult<()> {
        tokio::fs::create_dir_all(&self.pv_dir)
            .await
            .map_err(|err| ProvisionError::io(format!("error creating volume root {}", self.pv_dir.display()), err))?;
        self.channel.init().await
    }

    /// Provision a new volume for the given claim.
    #[tracing::instrument(level = "debug", skip(self, options), fields(volume = %options.pv_name))]
    pub async fn provision(&self, options: &VolumeOptions) -> ProvisionResult<PersistentVolume> {
        let res = self.try_provision(options).await;
        let outcome = match &res {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        metrics::increment_counter!(METRIC_PROVISION_RESULTS, "outcome" => outcome);
        res
    }

    /// Provision a new volume for the given claim and hand it to `persist`.
    ///
    /// When `persist` fails, the volume is torn down before its error is returned, so that no
    /// assignment outlives a descriptor which was never recorded.
    pub async fn provision_with<F, Fut>(&self, options: &VolumeOptions, persist: F) -> ProvisionResult<PersistentVolume>
    where
        F: FnOnce(PersistentVolume) -> Fut,
        Fut: Future<Output = ProvisionResult<()>>,
    {
        let volume = self.provision(options).await?;
        let err = match persist(volume.clone()).await {
            Ok(()) => return Ok(volume),
            Err(err) => err,
        };
        tracing::warn!(error = %err, volume = %options.pv_name, "error recording provisioned volume, rolling back");
        if let Err(rollback_err) = self.try_delete(&volume).await {
            tracing::error!(error = %rollback_err, volume = %options.pv_name, "error rolling back provisioned volume");
        }
        Err(err)
    }

    async fn try_provision(&self, options: &VolumeOptions) -> ProvisionResult<PersistentVolume> {
        // 1. Validate.
        let pvc = &options.pvc;
        let claim_name = pvc
            .metadata
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ProvisionError::InvalidSpec("claim has no name".into()))?;
        let namespace = pvc.metadata.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
        self.ledger.label_key(namespace, claim_name)?;
        volume::validate_volume_name(&options.pv_name)?;
        let spec = pvc
            .spec
            .as_ref()
            .ok_or_else(|| ProvisionError::InvalidSpec(format!("claim {} has no spec", claim_name)))?;
        let capacity = volume::requested_storage(spec)
            .ok_or_else(|| ProvisionError::InvalidSpec(format!("claim {} has no storage request", claim_name)))?;

        // 2. Prepare the local volume directory.
        let path = volume::volume_path(&self.pv_dir, &options.pv_name);
        create_volume_dir(&path).await?;

        // 3. Request a placement decision & wait for it.
        let mut shutdown = self.shutdown.subscribe();
        self.channel.request(&options.pv_name, pvc).await?;
        let placement = self
            .channel
            .await_response(&options.pv_name, self.poll_interval, self.placement_timeout, &mut shutdown)
            .await?;
        tracing::info!(claim = claim_name, node = %placement.node, "placement decision received");

        // 4. Record the assignment.
        match self.ledger.assign(namespace, claim_name, &placement.node).await {
            Ok(()) => (),
            Err(ProvisionError::NodeNotFound(node)) => {
                tracing::warn!(claim = claim_name, %node, "placement node not found, volume provisioned without affinity record");
            }
            Err(err) => return Err(err),
        }

        // 5. Build the descriptor.
        let access_modes = spec.access_modes.clone().unwrap_or_default();
        let volume = volume::build_volume(&VolumeParams {
            name: &options.pv_name,
            capacity: Some(capacity),
            access_modes: &access_modes,
            reclaim_policy: options.reclaim_policy.as_deref(),
            storage_class: spec.storage_class_name.as_deref(),
            claim_ref: claim_reference(pvc),
            root: &self.pv_dir,
            identity: &self.identity,
            provisioner_name: &self.name,
            node: &placement.node,
        })?;
        tracing::info!(claim = claim_name, node = %placement.node, "volume provisioned");
        Ok(volume)
    }

    /// Tear down the given volume, previously created by this provisioner.
    #[tracing::instrument(level = "debug", skip(self, volume), fields(volume = ?volume.metadata.name))]
    pub async fn delete(&self, volume: &PersistentVolume) -> ProvisionResult<()> {
        let res = self.try_delete(volume).await;
        let outcome = match &res {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        metrics::increment_counter!(METRIC_DELETE_RESULTS, "outcome" => outcome);
        res
    }

    async fn try_delete(&self, volume: &PersistentVolume) -> ProvisionResult<()> {
        // 1. Check ownership & extract affinity tags.
        let identity = volume::annotation(volume, ANNOTATION_IDENTITY)
            .ok_or_else(|| ProvisionError::InvalidSpec("identity annotation not found on volume".into()))?;
        if identity != self.identity {
            return Err(ProvisionError::Ignored(format!(
                "identity annotation {} on volume does not match ours {}",
                identity, self.identity
            )));
        }
        let name = volume
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ProvisionError::InvalidSpec("volume has no name".into()))?;
        volume::validate_volume_name(name)?;
        let node = volume::annotation(volume, ANNOTATION_NODE)
            .filter(|node| !node.is_empty())
            .ok_or_else(|| ProvisionError::InvalidSpec(format!("node annotation not found on volume {}", name)))?;
        let claim = volume::annotation(volume, ANNOTATION_CLAIM)
            .filter(|claim| !claim.is_empty())
            .ok_or_else(|| ProvisionError::InvalidSpec(format!("claim annotation not found on volume {}", name)))?;
        let namespace = volume
            .spec
            .as_ref()
            .and_then(|spec| spec.claim_ref.as_ref())
            .and_then(|claim_ref| claim_ref.namespace.as_deref())
            .unwrap_or(DEFAULT_NAMESPACE);

        // 2. Erase the assignment.
        match self.ledger.unassign(namespace, claim, node).await {
            Ok(()) => (),
            Err(ProvisionError::NodeNotFound(node)) => {
                tracing::warn!(claim, %node, "node of deleted volume not found, no affinity record to erase");
            }
            Err(err) => return Err(err),
        }

        // 3. Clean up the local volume directory.
        let path = volume::volume_path(&self.pv_dir, name);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => tracing::error!(error = ?err, path = %path.display(), "error removing volume directory"),
        }
        tracing::info!(claim, node, "volume deleted");
        Ok(())
    }
}

/// Create the directory backing a volume, open to all users of the host.
async fn create_volume_dir(path: &std::path::Path) -> ProvisionResult<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|err| ProvisionError::io(format!("error creating volume dir {}", path.display()), err))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
            .await
            .map_err(|err| ProvisionError::io(format!("error setting permissions on volume dir {}", path.display()), err))?;
    }
    Ok(())
}

/// Build a reference to the given claim, used to pre-bind the volume.
fn claim_reference(pvc: &PersistentVolumeClaim) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".into()),
        kind: Some("PersistentVolumeClaim".into()),
        name: pvc.metadata.name.clone(),
        namespace: pvc.metadata.namespace.clone(),
        uid: pvc.metadata.uid.clone(),
        resource_version: pvc.metadata.resource_version.clone(),
        ..Default::default()
    }
}
