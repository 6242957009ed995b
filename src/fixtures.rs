use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use maplit::btreemap;
use tokio::sync::Mutex;

use crate::error::{ProvisionError, ProvisionResult};
use crate::ledger::{NodeStore, WriteOutcome};
use crate::placement::{self, PlacementResponse};

/// An in-memory node inventory enforcing `resourceVersion` checks on update.
#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: Mutex<HashMap<String, Node>>,
    /// The number of upcoming updates which will be preempted by a competing writer.
    conflicts: AtomicUsize,
    /// The number of updates which were persisted.
    writes: AtomicUsize,
}

impl MemoryNodeStore {
    /// Create a new store holding the given nodes, each without labels.
    pub fn with_nodes(names: &[&str]) -> Self {
        let nodes = names
            .iter()
            .map(|name| {
                let node = Node {
                    metadata: ObjectMeta {
                        name: Some((*name).into()),
                        resource_version: Some("1".into()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                ((*name).to_string(), node)
            })
            .collect();
        Self {
            nodes: Mutex::new(nodes),
            ..Default::default()
        }
    }

    /// Cause the next `count` updates to lose a race against a competing writer.
    pub fn inject_conflicts(&self, count: usize) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    /// The number of updates which were persisted.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// The labels currently held by the given node.
    pub async fn labels(&self, name: &str) -> Option<std::collections::BTreeMap<String, String>> {
        let nodes = self.nodes.lock().await;
        nodes.get(name).map(|node| node.metadata.labels.clone().unwrap_or_default())
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn fetch_node(&self, name: &str) -> ProvisionResult<Option<Node>> {
        Ok(self.nodes.lock().await.get(name).cloned())
    }

    async fn update_node(&self, node: &Node) -> ProvisionResult<WriteOutcome> {
        let name = node.metadata.name.clone().unwrap_or_default();
        let mut nodes = self.nodes.lock().await;
        let current = nodes.get_mut(&name).ok_or_else(|| ProvisionError::NodeNotFound(name.clone()))?;

        if self.conflicts.load(Ordering::SeqCst) > 0 {
            self.conflicts.fetch_sub(1, Ordering::SeqCst);
            // A competing writer got there first.
            let labels = current.metadata.labels.get_or_insert_with(Default::default);
            labels.insert("competing-writer".into(), String::new());
            current.metadata.resource_version = Some(next_version(&current.metadata.resource_version));
            return Ok(WriteOutcome::Conflict);
        }
        if current.metadata.resource_version != node.metadata.resource_version {
            return Ok(WriteOutcome::Conflict);
        }

        let mut updated = node.clone();
        updated.metadata.resource_version = Some(next_version(&current.metadata.resource_version));
        *current = updated;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(WriteOutcome::Written)
    }
}

fn next_version(version: &Option<String>) -> String {
    let current: u64 = version.as_deref().and_then(|val| val.parse().ok()).unwrap_or(0);
    (current + 1).to_string()
}

/// Build a pending claim in the default namespace requesting the given capacity & access modes.
pub fn claim(name: &str, capacity: Option<&str>, access_modes: &[&str]) -> PersistentVolumeClaim {
    namespaced_claim("default", name, capacity, access_modes)
}

/// Build a pending claim in the given namespace.
pub fn namespaced_claim(namespace: &str, name: &str, capacity: Option<&str>, access_modes: &[&str]) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            uid: Some(format!("{}-{}-uid", namespace, name)),
            resource_version: Some("1".into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes.iter().map(|mode| mode.to_string()).collect()),
            storage_class_name: Some("local-placed".into()),
            resources: Some(ResourceRequirements {
                requests: capacity.map(|capacity| btreemap! { "storage".to_string() => Quantity(capacity.into()) }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Act as the decision-maker, publishing a response for the given volume.
pub async fn publish_response(placement_dir: &Path, name: &str, node: &str) -> Result<()> {
    let res = PlacementResponse { name: name.into(), node: node.into() };
    publish_raw_response(placement_dir, name, &serde_json::to_vec(&res)?).await
}

/// Publish an arbitrary payload as the response artifact of the given volume.
pub async fn publish_raw_response(placement_dir: &Path, file_stem: &str, payload: &[u8]) -> Result<()> {
    let path = placement_dir.join("res").join(format!("{}.json", file_stem));
    placement::publish(&path, payload).await?;
    Ok(())
}
