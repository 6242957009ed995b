//! Scheduling of provisioning & deletion operations.
//!
//! Operations are spawned as independent tasks. The volume name of each operation is recorded in
//! the controller's in-flight set for the lifetime of the task, and a task is not spawned for a
//! volume which already has one in flight. Failures which the provisioner reports as retryable
//! are re-queued after a delay; all other failures are logged and dropped until the next watcher
//! event for the object.

use std::time::Duration;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, PostParams};
use kube::client::Client;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use crate::error::{ProvisionError, ProvisionResult};
use crate::k8s::data::{claim_storage_class, volume_name_for_claim};
use crate::k8s::{emit_scheduler_task, Controller, InFlight};
use crate::provisioner::{Provisioner, VolumeOptions};

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// A scheduling task to be performed.
#[derive(Debug)]
pub enum SchedulerTask {
    ProvisionClaim(Box<PersistentVolumeClaim>),
    DeleteVolume(Box<PersistentVolume>),
}

impl Controller {
    /// Handle scheduler tasks.
    pub(super) fn handle_scheduler_task(&mut self, task: SchedulerTask) {
        let volume_name = match &task {
            SchedulerTask::ProvisionClaim(claim) => volume_name_for_claim(claim),
            SchedulerTask::DeleteVolume(volume) => volume.metadata.name.clone(),
        };
        let volume_name = match volume_name {
            Some(volume_name) => volume_name,
            None => return, // Not actually possible as K8s requires name & uid.
        };
        if self.in_flight.insert(volume_name.clone(), ()).is_some() {
            tracing::debug!(volume = %volume_name, "operation already in flight for volume");
            return;
        }

        let op = Operation {
            client: self.client.clone(),
            provisioner: self.provisioner.clone(),
            in_flight: self.in_flight.clone(),
            tasks_tx: self.scheduler_tasks_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            volume_name,
        };
        tokio::spawn(op.run(task));
    }
}

/// A single spawned provisioning or deletion operation.
struct Operation {
    client: Client,
    provisioner: Provisioner,
    in_flight: InFlight,
    tasks_tx: mpsc::Sender<SchedulerTask>,
    shutdown_tx: broadcast::Sender<()>,
    volume_name: String,
}

impl Operation {
    async fn run(self, task: SchedulerTask) {
        let res = match &task {
            SchedulerTask::ProvisionClaim(claim) => self.provision_claim(claim).await,
            SchedulerTask::DeleteVolume(volume) => self.delete_volume(volume).await,
        };
        self.in_flight.remove(&self.volume_name);

        let err = match res {
            Ok(()) => return,
            Err(err) => err,
        };
        if matches!(err, ProvisionError::Canceled) {
            tracing::debug!(volume = %self.volume_name, "operation canceled");
            return;
        }
        tracing::error!(error = %err, volume = %self.volume_name, retryable = err.is_retryable(), "error handling scheduler task");
        if err.is_retryable() {
            emit_scheduler_task(self.tasks_tx.clone(), self.shutdown_tx.subscribe(), task, true);
        }
    }

    /// Provision a volume for the given claim & create it in K8s.
    #[tracing::instrument(level = "debug", skip(self, claim), fields(volume = %self.volume_name))]
    async fn provision_claim(&self, claim: &PersistentVolumeClaim) -> ProvisionResult<()> {
        let class_name = match claim_storage_class(claim) {
            Some(class_name) => class_name,
            None => return Ok(()),
        };
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        let class = match timeout(API_TIMEOUT, classes.get(class_name))
            .await
            .map_err(|_| ProvisionError::api_timeout("fetching storage class"))?
        {
            Ok(class) => class,
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if class.provisioner != self.provisioner.name() {
            return Ok(());
        }

        // The claim may have been handled by an earlier operation since this task was queued.
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        match timeout(API_TIMEOUT, volumes.get(&self.volume_name))
            .await
            .map_err(|_| ProvisionError::api_timeout("fetching volume"))?
        {
            Ok(_volume) => {
                tracing::debug!("volume already exists for claim");
                return Ok(());
            }
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => (),
            Err(err) => return Err(err.into()),
        }

        let options = VolumeOptions {
            pv_name: self.volume_name.clone(),
            reclaim_policy: class.reclaim_policy.clone(),
            pvc: claim.clone(),
        };
        let volume_name = self.volume_name.clone();
        self.provisioner
            .provision_with(&options, move |volume| async move {
                tracing::info!(volume = %volume_name, "creating PersistentVolume");
                match timeout(API_TIMEOUT, volumes.create(&PostParams::default(), &volume))
                    .await
                    .map_err(|_| ProvisionError::api_timeout("creating volume"))?
                {
                    Ok(_volume) => Ok(()),
                    Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::CONFLICT => Ok(()),
                    Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::UNPROCESSABLE_ENTITY => {
                        Err(ProvisionError::InvalidSpec(format!("volume {} rejected: {}", volume_name, api_err.message)))
                    }
                    Err(err) => Err(err.into()),
                }
            })
            .await?;
        Ok(())
    }

    /// Tear down the given volume & delete it from K8s.
    #[tracing::instrument(level = "debug", skip(self, volume), fields(volume = %self.volume_name))]
    async fn delete_volume(&self, volume: &PersistentVolume) -> ProvisionResult<()> {
        match self.provisioner.delete(volume).await {
            Ok(()) => (),
            Err(ProvisionError::Ignored(reason)) => {
                tracing::debug!(%reason, "volume belongs to another provisioner instance");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        tracing::info!("deleting PersistentVolume");
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        match timeout(API_TIMEOUT, volumes.delete(&self.volume_name, &DeleteParams::default()))
            .await
            .map_err(|_| ProvisionError::api_timeout("deleting volume"))?
        {
            Ok(_val) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
