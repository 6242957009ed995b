//! The placement channel.
//!
//! Placement decisions are made by an external process which is scheduled independently of this
//! provisioner. The two communicate through a shared directory acting as a mailbox:
//!
//! - `req/<volume>.json` holds a `PlacementRequest`, written by this provisioner.
//! - `res/<volume>.json` holds a `PlacementResponse`, written by the decision-maker.
//!
//! The volume name is the only correlation key. Every artifact is first written under a hidden
//! temporary name in the same directory and then renamed into place, so a reader never observes
//! a partially written document. Responses are deleted as soon as they are read.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{ProvisionError, ProvisionResult};

/// The sub-directory holding placement requests.
const REQUESTS_DIR: &str = "req";
/// The sub-directory holding placement responses.
const RESPONSES_DIR: &str = "res";
/// The extension of all placement artifacts.
const ARTIFACT_EXT: &str = "json";

pub const METRIC_PLACEMENT_WAIT_SECONDS: &str = "vcd_provisioner_placement_wait_seconds";

/// A request for a placement decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRequest {
    /// The name of the volume to be placed.
    pub name: String,
    /// The access modes requested by the claim.
    pub access_modes: Vec<String>,
    /// The storage capacity requested by the claim.
    pub capacity: Quantity,
    /// The metadata of the originating claim.
    pub claim_metadata: ObjectMeta,
}

impl PlacementRequest {
    /// Build a request for the given volume from its originating claim.
    pub fn from_claim(name: &str, claim: &PersistentVolumeClaim) -> ProvisionResult<Self> {
        crate::volume::validate_volume_name(name)?;
        let spec = claim
            .spec
            .as_ref()
            .ok_or_else(|| ProvisionError::InvalidSpec("claim has no spec".into()))?;
        let capacity = crate::volume::requested_storage(spec)
            .cloned()
            .ok_or_else(|| ProvisionError::InvalidSpec("claim has no storage request".into()))?;
        Ok(Self {
            name: name.into(),
            access_modes: spec.access_modes.clone().unwrap_or_default(),
            capacity,
            claim_metadata: claim.metadata.clone(),
        })
    }
}

/// A placement decision published by the external decision-maker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementResponse {
    /// The name of the volume which was placed; must match the request.
    pub name: String,
    /// The node chosen to host the volume.
    pub node: String,
}

/// A directory based request/response mailbox for placement decisions.
#[derive(Clone, Debug)]
pub struct PlacementChannel {
    requests: PathBuf,
    responses: PathBuf,
}

impl PlacementChannel {
    /// Create a new instance rooted at the given base directory.
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            requests: base.join(REQUESTS_DIR),
            responses: base.join(RESPONSES_DIR),
        }
    }

    /// Ensure the request and response directories exist.
    pub async fn init(&self) -> ProvisionResult<()> {
        for dir in [&self.requests, &self.responses] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|err| ProvisionError::io(format!("error creating placement dir {}", dir.display()), err))?;
        }
        Ok(())
    }

    /// The path of the request artifact for the given volume.
    pub fn request_path(&self, name: &str) -> PathBuf {
        self.requests.join(format!("{}.{}", name, ARTIFACT_EXT))
    }

    /// The path of the response artifact for the given volume.
    pub fn response_path(&self, name: &str) -> PathBuf {
        self.responses.join(format!("{}.{}", name, ARTIFACT_EXT))
    }

    /// Publish a placement request for the given volume.
    #[tracing::instrument(level = "debug", skip(self, claim))]
    pub async fn request(&self, name: &str, claim: &PersistentVolumeClaim) -> ProvisionResult<()> {
        let req = PlacementRequest::from_claim(name, claim)?;
        let payload = serde_json::to_vec_pretty(&req).map_err(|err| ProvisionError::InvalidSpec(format!("error serializing placement request: {}", err)))?;
        publish(&self.request_path(name), &payload).await?;
        tracing::debug!(volume = name, "placement request published");
        Ok(())
    }

    /// Wait for the placement response of the given volume.
    ///
    /// The response directory is checked every `poll_interval` until a response is found or
    /// `timeout` elapses. A found response is deleted before being returned. The request
    /// artifact is left untouched on timeout and on cancellation.
    #[tracing::instrument(level = "debug", skip(self, shutdown))]
    pub async fn await_response(
        &self, name: &str, poll_interval: Duration, timeout: Duration, shutdown: &mut broadcast::Receiver<()>,
    ) -> ProvisionResult<PlacementResponse> {
        let start = Instant::now();
        let res = tokio::select! {
            res = tokio::time::timeout(timeout, self.poll_response(name, poll_interval)) => match res {
                Ok(res) => res,
                Err(_elapsed) => Err(ProvisionError::PlacementTimeout { name: name.into(), timeout }),
            },
            _ = shutdown.recv() => Err(ProvisionError::Canceled),
        };
        metrics::histogram!(METRIC_PLACEMENT_WAIT_SECONDS, start.elapsed().as_secs_f64());
        res
    }

    async fn poll_response(&self, name: &str, poll_interval: Duration) -> ProvisionResult<PlacementResponse> {
        let path = self.response_path(name);
        loop {
            if let Some(res) = self.try_consume(name, &path).await? {
                return Ok(res);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Read and delete the response at the given path, if present.
    ///
    /// An artifact which fails to parse or which names a different volume is still consumed,
    /// so that a subsequent retry waits for a fresh decision.
    async fn try_consume(&self, name: &str, path: &Path) -> ProvisionResult<Option<PlacementResponse>> {
        let payload = match tokio::fs::read(path).await {
            Ok(payload) => payload,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ProvisionError::io(format!("error reading placement response {}", path.display()), err)),
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => return Err(ProvisionError::io(format!("error consuming placement response {}", path.display()), err)),
        }

        let res: PlacementResponse = serde_json::from_slice(&payload)
            .map_err(|err| ProvisionError::ProtocolMismatch(format!("malformed placement response for volume {}: {}", name, err)))?;
        if res.name != name {
            return Err(ProvisionError::ProtocolMismatch(format!(
                "placement response for volume {} names volume {}",
                name, res.name
            )));
        }
        if res.node.is_empty() {
            return Err(ProvisionError::ProtocolMismatch(format!("placement response for volume {} names no node", name)));
        }
        tracing::debug!(volume = name, node = %res.node, "placement response consumed");
        Ok(Some(res))
    }
}

/// Write the given payload to `path` through a temporary file and an atomic rename.
pub(crate) async fn publish(path: &Path, payload: &[u8]) -> ProvisionResult<()> {
    let tmp = temp_path(path);
    if let Err(err) = tokio::fs::write(&tmp, payload).await {
        return Err(ProvisionError::io(format!("error writing placement artifact {}", tmp.display()), err));
    }
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _res = tokio::fs::remove_file(&tmp).await;
        return Err(ProvisionError::io(format!("error publishing placement artifact {}", path.display()), err));
    }
    Ok(())
}

/// The hidden temporary sibling of the given artifact path.
fn temp_path(path: &Path) -> PathBuf {
    let file_name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", file_name))
}
