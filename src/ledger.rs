//! The node affinity ledger.
//!
//! The placement of each claim's volume is recorded as a label on the hosting node object, with an
//! empty value. Presence of the label is the assignment. The key is `{prefix}/{namespace}.{claim}`;
//! when the name part would exceed the 63 character limit of label names it is truncated and
//! suffixed with a hash of the full namespaced claim name, so every claim maps to a valid and
//! distinct key.
//!
//! Node objects are owned by the K8s control plane and may be modified concurrently by other
//! actors. All updates are read-modify-write cycles guarded by the node's `resourceVersion`; a
//! conflicting write is retried once against a freshly read node before giving up.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, PostParams};
use kube::client::Client;
use tokio::time::timeout;

use crate::error::{ProvisionError, ProvisionResult};

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The number of times a conflicting node update is retried.
const CONFLICT_RETRIES: usize = 1;
/// The maximum length of the name part of a label key.
const LABEL_NAME_MAX_LEN: usize = 63;
/// The maximum length of the prefix part of a label key.
const LABEL_PREFIX_MAX_LEN: usize = 253;
/// The length of the hex encoded hash suffix of truncated label names.
const LABEL_HASH_LEN: usize = 16;

pub const METRIC_LEDGER_CONFLICTS: &str = "vcd_provisioner_ledger_conflicts";

/// The outcome of a node update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The update was persisted.
    Written,
    /// The update was rejected as the given node was stale.
    Conflict,
}

/// Access to the cluster's node inventory.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetch the named node, if it exists.
    async fn fetch_node(&self, name: &str) -> ProvisionResult<Option<Node>>;

    /// Persist the given node, guarded by its `resourceVersion`.
    async fn update_node(&self, node: &Node) -> ProvisionResult<WriteOutcome>;
}

/// A `NodeStore` backed by the K8s API.
#[derive(Clone)]
pub struct KubeNodeStore {
    api: Api<Node>,
}

impl KubeNodeStore {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch_node(&self, name: &str) -> ProvisionResult<Option<Node>> {
        let res = timeout(API_TIMEOUT, self.api.get(name)).await.map_err(|_| ProvisionError::api_timeout("fetching node"))?;
        match res {
            Ok(node) => Ok(Some(node)),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, node))]
    async fn update_node(&self, node: &Node) -> ProvisionResult<WriteOutcome> {
        let name = node
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ProvisionError::InvalidSpec("node has no name".into()))?;
        let mut node = node.clone();
        node.metadata.managed_fields = None;
        let res = timeout(API_TIMEOUT, self.api.replace(name, &PostParams::default(), &node))
            .await
            .map_err(|_| ProvisionError::api_timeout("updating node"))?;
        match res {
            Ok(_node) => Ok(WriteOutcome::Written),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::CONFLICT => Ok(WriteOutcome::Conflict),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Err(ProvisionError::NodeNotFound(name.into())),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::UNPROCESSABLE_ENTITY => {
                Err(ProvisionError::InvalidSpec(format!("update of node {} rejected: {}", name, api_err.message)))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Records which node hosts the volume of each claim.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn NodeStore>,
    prefix: String,
}

impl Ledger {
    /// Create a new instance.
    pub fn new(store: Arc<dyn NodeStore>, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into() }
    }

    /// The label key recording an assignment for the given claim.
    pub fn label_key(&self, namespace: &str, claim: &str) -> ProvisionResult<String> {
        if namespace.is_empty() || claim.is_empty() {
            return Err(ProvisionError::InvalidSpec("claim namespace and name must not be empty".into()));
        }
        let namespaced = format!("{}.{}", namespace, claim);
        let name = if namespaced.len() <= LABEL_NAME_MAX_LEN {
            namespaced
        } else {
            let hash = seahash::hash(namespaced.as_bytes());
            let mut cut = LABEL_NAME_MAX_LEN - LABEL_HASH_LEN - 1;
            while !namespaced.is_char_boundary(cut) {
                cut -= 1;
            }
            let head = namespaced[..cut].trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
            format!("{}-{:016x}", head, hash)
        };
        let key = format!("{}/{}", self.prefix, name);
        validate_label_key(&key)?;
        Ok(key)
    }

    /// Record that the given node hosts the volume of the given claim.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn assign(&self, namespace: &str, claim: &str, node: &str) -> ProvisionResult<()> {
        let key = self.label_key(namespace, claim)?;
        self.update_labels(node, |labels| match labels.get(&key) {
            Some(val) if val.is_empty() => false,
            _ => {
                labels.insert(key.clone(), String::new());
                true
            }
        })
        .await?;
        tracing::info!(namespace, claim, node, label = %key, "claim assigned to node");
        Ok(())
    }

    /// Erase the assignment of the given claim from the given node.
    ///
    /// Erasing an assignment which does not exist is a no-op.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn unassign(&self, namespace: &str, claim: &str, node: &str) -> ProvisionResult<()> {
        let key = self.label_key(namespace, claim)?;
        self.update_labels(node, |labels| labels.remove(&key).is_some()).await?;
        tracing::info!(namespace, claim, node, label = %key, "claim unassigned from node");
        Ok(())
    }

    /// Apply `mutate` to the labels of the given node and persist the result.
    ///
    /// `mutate` returns `false` when it made no change, in which case nothing is written.
    async fn update_labels<F>(&self, node: &str, mutate: F) -> ProvisionResult<()>
    where
        F: Fn(&mut BTreeMap<String, String>) -> bool + Send + Sync,
    {
        for attempt in 0..=CONFLICT_RETRIES {
            let mut obj = self
                .store
                .fetch_node(node)
                .await?
                .ok_or_else(|| ProvisionError::NodeNotFound(node.into()))?;
            let labels = obj.metadata.labels.get_or_insert_with(Default::default);
            if !mutate(labels) {
                return Ok(());
            }
            match self.store.update_node(&obj).await? {
                WriteOutcome::Written => return Ok(()),
                WriteOutcome::Conflict => {
                    metrics::increment_counter!(METRIC_LEDGER_CONFLICTS);
                    tracing::debug!(node, attempt, "conflict while updating node labels");
                }
            }
        }
        Err(ProvisionError::LedgerConflict(node.into()))
    }
}

/// Ensure the given prefix may be used as the prefix of a label key.
pub fn validate_label_prefix(prefix: &str) -> ProvisionResult<()> {
    let is_valid = !prefix.is_empty()
        && prefix.len() <= LABEL_PREFIX_MAX_LEN
        && prefix.split('.').all(|part| {
            !part.is_empty()
                && part.len() <= LABEL_NAME_MAX_LEN
                && part.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !part.starts_with('-')
                && !part.ends_with('-')
        });
    if !is_valid {
        return Err(ProvisionError::InvalidSpec(format!("label prefix {} is not a valid DNS subdomain", prefix)));
    }
    Ok(())
}

/// Ensure the given `{prefix}/{name}` string is a valid label key.
fn validate_label_key(key: &str) -> ProvisionResult<()> {
    let (prefix, name) = key
        .split_once('/')
        .ok_or_else(|| ProvisionError::InvalidSpec(format!("label key {} has no prefix", key)))?;
    validate_label_prefix(prefix)?;
    let is_valid = !name.is_empty()
        && name.len() <= LABEL_NAME_MAX_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !is_valid {
        return Err(ProvisionError::InvalidSpec(format!("label key {} is not a valid label name", key)));
    }
    Ok(())
}
