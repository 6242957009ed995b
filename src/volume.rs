//! Volume resource construction.

use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, ObjectReference, PersistentVolume, PersistentVolumeClaimSpec,
    PersistentVolumeSpec, VolumeNodeAffinity,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use maplit::btreemap;

use crate::error::{ProvisionError, ProvisionResult};

/// The annotation holding the identity of the provisioner instance which created a volume.
pub const ANNOTATION_IDENTITY: &str = "vcdProvisionerIdentity";
/// The annotation holding the node chosen to host a volume.
pub const ANNOTATION_NODE: &str = "vcdProvisionerNode";
/// The annotation holding the name of the claim for which a volume was created.
pub const ANNOTATION_CLAIM: &str = "vcdProvisionerClaim";
/// The canonical K8s annotation naming the provisioner of a volume.
pub const ANNOTATION_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";
/// The canonical K8s node label holding the node's hostname.
const LABEL_K8S_HOSTNAME: &str = "kubernetes.io/hostname";
/// The resource name of storage capacity.
const RESOURCE_STORAGE: &str = "storage";
/// The reclaim policy used when none is given.
pub const DEFAULT_RECLAIM_POLICY: &str = "Delete";

/// The inputs of a volume descriptor.
#[derive(Clone, Debug)]
pub struct VolumeParams<'a> {
    /// The name of the volume.
    pub name: &'a str,
    /// The requested storage capacity.
    pub capacity: Option<&'a Quantity>,
    /// The requested access modes.
    pub access_modes: &'a [String],
    /// The reclaim policy, defaulting to `Delete`.
    pub reclaim_policy: Option<&'a str>,
    /// The storage class of the originating claim.
    pub storage_class: Option<&'a str>,
    /// A reference to the originating claim.
    pub claim_ref: ObjectReference,
    /// The root directory under which the volume directory lives.
    pub root: &'a Path,
    /// The identity of this provisioner instance.
    pub identity: &'a str,
    /// The registered name of this provisioner.
    pub provisioner_name: &'a str,
    /// The node chosen to host the volume.
    pub node: &'a str,
}

/// Build the volume descriptor for the given params.
///
/// The descriptor is tagged with this provisioner's identity, the hosting node and the
/// originating claim name. Those tags are what `Provisioner::delete` later relies upon.
pub fn build_volume(params: &VolumeParams<'_>) -> ProvisionResult<PersistentVolume> {
    validate_volume_name(params.name)?;
    let capacity = params
        .capacity
        .cloned()
        .ok_or_else(|| ProvisionError::InvalidSpec(format!("volume {} has no capacity", params.name)))?;
    let claim_name = params
        .claim_ref
        .name
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ProvisionError::InvalidSpec(format!("volume {} has no claim name", params.name)))?;
    if params.node.is_empty() {
        return Err(ProvisionError::InvalidSpec(format!("volume {} has no target node", params.name)));
    }

    let path = volume_path(params.root, params.name);
    Ok(PersistentVolume {
        metadata: ObjectMeta {
            name: Some(params.name.into()),
            annotations: Some(btreemap! {
                ANNOTATION_IDENTITY.into() => params.identity.into(),
                ANNOTATION_NODE.into() => params.node.into(),
                ANNOTATION_CLAIM.into() => claim_name.into(),
                ANNOTATION_PROVISIONED_BY.into() => params.provisioner_name.into(),
            }),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            persistent_volume_reclaim_policy: Some(params.reclaim_policy.unwrap_or(DEFAULT_RECLAIM_POLICY).into()),
            access_modes: Some(params.access_modes.to_vec()),
            capacity: Some(btreemap! { RESOURCE_STORAGE.into() => capacity }),
            storage_class_name: params.storage_class.map(String::from),
            claim_ref: Some(params.claim_ref.clone()),
            host_path: Some(HostPathVolumeSource {
                path: path.to_string_lossy().into_owned(),
                type_: None,
            }),
            node_affinity: Some(VolumeNodeAffinity {
                required: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: LABEL_K8S_HOSTNAME.into(),
                            operator: "In".into(),
                            values: Some(vec![params.node.into()]),
                        }]),
                        match_fields: None,
                    }],
                }),
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// The directory backing the given volume.
pub fn volume_path(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

/// The storage capacity requested by the given claim spec.
pub fn requested_storage(spec: &PersistentVolumeClaimSpec) -> Option<&Quantity> {
    spec.resources
        .as_ref()
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get(RESOURCE_STORAGE))
}

/// Get the value of the given annotation on a volume.
pub fn annotation<'a>(volume: &'a PersistentVolume, key: &str) -> Option<&'a str> {
    volume
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Ensure the given name is usable both as an object name and as a single path component.
pub fn validate_volume_name(name: &str) -> ProvisionResult<()> {
    if name.is_empty() {
        return Err(ProvisionError::InvalidSpec("volume name must not be empty".into()));
    }
    if name.starts_with('.') || name.contains(std::path::is_separator) {
        return Err(ProvisionError::InvalidSpec(format!("volume name {} is not a valid path component", name)));
    }
    Ok(())
}
