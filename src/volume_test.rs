use std::path::Path;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::ProvisionError;
use crate::volume::*;

fn claim_ref() -> ObjectReference {
    ObjectReference {
        kind: Some("PersistentVolumeClaim".into()),
        name: Some("data-a".into()),
        namespace: Some("default".into()),
        ..Default::default()
    }
}

fn params<'a>(capacity: Option<&'a Quantity>, access_modes: &'a [String]) -> VolumeParams<'a> {
    VolumeParams {
        name: "pvc-A",
        capacity,
        access_modes,
        reclaim_policy: None,
        storage_class: Some("local-placed"),
        claim_ref: claim_ref(),
        root: Path::new("/tmp/vcd-provisioner"),
        identity: "provisioner-node",
        provisioner_name: "vmware.com/vcloud-director",
        node: "node-7",
    }
}

#[test]
fn volume_carries_capacity_and_access_modes() -> Result<()> {
    let capacity = Quantity("10Gi".into());
    let modes = vec!["ReadWriteOnce".to_string()];

    let volume = build_volume(&params(Some(&capacity), &modes))?;

    let spec = volume.spec.context("expected volume spec")?;
    let storage = spec.capacity.as_ref().and_then(|capacity| capacity.get("storage"));
    assert_eq!(storage, Some(&capacity), "expected exact requested capacity");
    assert_eq!(spec.access_modes, Some(modes), "expected exact requested access modes");
    assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some(DEFAULT_RECLAIM_POLICY));
    assert_eq!(spec.storage_class_name.as_deref(), Some("local-placed"));
    assert_eq!(spec.claim_ref.and_then(|claim| claim.name).as_deref(), Some("data-a"));
    Ok(())
}

#[test]
fn volume_is_host_path_pinned_to_node() -> Result<()> {
    let capacity = Quantity("1Gi".into());
    let modes = vec!["ReadWriteOnce".to_string()];

    let volume = build_volume(&params(Some(&capacity), &modes))?;

    assert_eq!(volume.metadata.name.as_deref(), Some("pvc-A"));
    let spec = volume.spec.as_ref().context("expected volume spec")?;
    let host_path = spec.host_path.as_ref().context("expected host path source")?;
    assert_eq!(host_path.path, "/tmp/vcd-provisioner/pvc-A", "unexpected host path");
    let terms = &spec
        .node_affinity
        .as_ref()
        .and_then(|affinity| affinity.required.as_ref())
        .context("expected required node affinity")?
        .node_selector_terms;
    let expr = &terms[0].match_expressions.as_ref().context("expected match expressions")?[0];
    assert_eq!(expr.key, "kubernetes.io/hostname");
    assert_eq!(expr.operator, "In");
    assert_eq!(expr.values, Some(vec!["node-7".to_string()]));
    Ok(())
}

#[test]
fn volume_is_tagged_for_deletion() -> Result<()> {
    let capacity = Quantity("1Gi".into());
    let modes = vec![];

    let volume = build_volume(&params(Some(&capacity), &modes))?;

    assert_eq!(annotation(&volume, ANNOTATION_IDENTITY), Some("provisioner-node"));
    assert_eq!(annotation(&volume, ANNOTATION_NODE), Some("node-7"));
    assert_eq!(annotation(&volume, ANNOTATION_CLAIM), Some("data-a"));
    assert_eq!(annotation(&volume, ANNOTATION_PROVISIONED_BY), Some("vmware.com/vcloud-director"));
    Ok(())
}

#[test]
fn volume_uses_given_reclaim_policy() -> Result<()> {
    let capacity = Quantity("1Gi".into());
    let modes = vec![];
    let mut params = params(Some(&capacity), &modes);
    params.reclaim_policy = Some("Retain");

    let volume = build_volume(&params)?;

    let policy = volume.spec.and_then(|spec| spec.persistent_volume_reclaim_policy);
    assert_eq!(policy.as_deref(), Some("Retain"));
    Ok(())
}

#[test]
fn missing_capacity_is_invalid() {
    let modes = vec!["ReadWriteOnce".to_string()];
    let res = build_volume(&params(None, &modes));
    assert!(matches!(res, Err(ProvisionError::InvalidSpec(_))), "expected InvalidSpec, got {:?}", res);
}

#[test]
fn empty_name_is_invalid() {
    let capacity = Quantity("1Gi".into());
    let modes = vec![];
    let mut params = params(Some(&capacity), &modes);
    params.name = "";

    let res = build_volume(&params);

    assert!(matches!(res, Err(ProvisionError::InvalidSpec(_))), "expected InvalidSpec, got {:?}", res);
}

#[test]
fn empty_node_is_invalid() {
    let capacity = Quantity("1Gi".into());
    let modes = vec![];
    let mut params = params(Some(&capacity), &modes);
    params.node = "";

    let res = build_volume(&params);

    assert!(matches!(res, Err(ProvisionError::InvalidSpec(_))), "expected InvalidSpec, got {:?}", res);
}

#[test]
fn volume_names_must_be_single_path_components() {
    assert!(validate_volume_name("pvc-1234").is_ok());
    assert!(validate_volume_name("").is_err());
    assert!(validate_volume_name("../etc").is_err());
    assert!(validate_volume_name("a/b").is_err());
    assert!(validate_volume_name(".hidden").is_err());
}
