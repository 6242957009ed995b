use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use crate::error::ProvisionError;
use crate::fixtures;
use crate::placement::*;

const POLL: Duration = Duration::from_millis(20);

async fn setup_channel() -> Result<(PlacementChannel, tempfile::TempDir)> {
    let tmpdir = tempfile::tempdir().context("error creating tmp dir for test")?;
    let channel = PlacementChannel::new(tmpdir.path());
    channel.init().await?;
    Ok((channel, tmpdir))
}

#[tokio::test]
async fn request_writes_claim_details() -> Result<()> {
    let (channel, _tmpdir) = setup_channel().await?;
    let claim = fixtures::claim("data-a", Some("10Gi"), &["ReadWriteOnce"]);

    channel.request("pvc-A", &claim).await?;

    let payload = tokio::fs::read(channel.request_path("pvc-A")).await?;
    let req: PlacementRequest = serde_json::from_slice(&payload)?;
    assert_eq!(req.name, "pvc-A", "expected request to name the volume");
    assert_eq!(req.access_modes, vec!["ReadWriteOnce".to_string()], "expected request to carry access modes");
    assert_eq!(req.capacity.0, "10Gi", "expected request to carry capacity");
    assert_eq!(req.claim_metadata.name.as_deref(), Some("data-a"), "expected request to carry claim metadata");

    let raw: serde_json::Value = serde_json::from_slice(&payload)?;
    assert!(raw.get("accessModes").is_some(), "expected camelCase field names, got {}", raw);
    assert!(raw.get("claimMetadata").is_some(), "expected camelCase field names, got {}", raw);

    Ok(())
}

#[tokio::test]
async fn request_without_capacity_is_rejected() -> Result<()> {
    let (channel, _tmpdir) = setup_channel().await?;
    let claim = fixtures::claim("data-a", None, &["ReadWriteOnce"]);

    let res = channel.request("pvc-A", &claim).await;

    assert!(matches!(res, Err(ProvisionError::InvalidSpec(_))), "expected InvalidSpec, got {:?}", res);
    assert!(!channel.request_path("pvc-A").exists(), "expected no request artifact to be written");
    Ok(())
}

#[tokio::test]
async fn request_fails_without_mailbox_dirs() -> Result<()> {
    let tmpdir = tempfile::tempdir().context("error creating tmp dir for test")?;
    let channel = PlacementChannel::new(tmpdir.path().join("missing"));
    let claim = fixtures::claim("data-a", Some("1Gi"), &["ReadWriteOnce"]);

    let res = channel.request("pvc-A", &claim).await;

    assert!(matches!(res, Err(ProvisionError::Io { .. })), "expected Io, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn matching_response_is_returned_and_consumed() -> Result<()> {
    let (channel, tmpdir) = setup_channel().await?;
    let (_tx, mut shutdown) = broadcast::channel(1);
    fixtures::publish_response(tmpdir.path(), "pvc-A", "node-7").await?;

    let res = channel.await_response("pvc-A", POLL, Duration::from_secs(2), &mut shutdown).await?;

    assert_eq!(res, PlacementResponse { name: "pvc-A".into(), node: "node-7".into() });
    assert!(!channel.response_path("pvc-A").exists(), "expected response artifact to be consumed");
    Ok(())
}

#[tokio::test]
async fn late_response_is_observed() -> Result<()> {
    let (channel, tmpdir) = setup_channel().await?;
    let (_tx, mut shutdown) = broadcast::channel(1);
    let base = tmpdir.path().to_path_buf();
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        fixtures::publish_response(&base, "pvc-A", "node-7").await
    });

    let res = channel.await_response("pvc-A", POLL, Duration::from_secs(5), &mut shutdown).await?;
    writer.await??;

    assert_eq!(res.node, "node-7", "expected node from late response");
    Ok(())
}

#[tokio::test]
async fn response_naming_other_volume_is_a_mismatch() -> Result<()> {
    let (channel, tmpdir) = setup_channel().await?;
    let (_tx, mut shutdown) = broadcast::channel(1);
    let payload = serde_json::to_vec(&PlacementResponse { name: "pvc-B".into(), node: "node-7".into() })?;
    fixtures::publish_raw_response(tmpdir.path(), "pvc-A", &payload).await?;

    let res = channel.await_response("pvc-A", POLL, Duration::from_secs(2), &mut shutdown).await;

    assert!(matches!(res, Err(ProvisionError::ProtocolMismatch(_))), "expected ProtocolMismatch, got {:?}", res);
    assert!(!channel.response_path("pvc-A").exists(), "expected mismatched artifact to be consumed");
    Ok(())
}

#[tokio::test]
async fn malformed_response_is_a_mismatch() -> Result<()> {
    let (channel, tmpdir) = setup_channel().await?;
    let (_tx, mut shutdown) = broadcast::channel(1);
    fixtures::publish_raw_response(tmpdir.path(), "pvc-A", b"{not json").await?;

    let res = channel.await_response("pvc-A", POLL, Duration::from_secs(2), &mut shutdown).await;

    assert!(matches!(res, Err(ProvisionError::ProtocolMismatch(_))), "expected ProtocolMismatch, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn response_with_empty_node_is_a_mismatch() -> Result<()> {
    let (channel, tmpdir) = setup_channel().await?;
    let (_tx, mut shutdown) = broadcast::channel(1);
    fixtures::publish_response(tmpdir.path(), "pvc-A", "").await?;

    let res = channel.await_response("pvc-A", POLL, Duration::from_secs(2), &mut shutdown).await;

    assert!(matches!(res, Err(ProvisionError::ProtocolMismatch(_))), "expected ProtocolMismatch, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn missing_response_times_out_leaving_request() -> Result<()> {
    let (channel, tmpdir) = setup_channel().await?;
    let (_tx, mut shutdown) = broadcast::channel(1);
    let claim = fixtures::claim("data-a", Some("1Gi"), &["ReadWriteOnce"]);
    channel.request("pvc-A", &claim).await?;
    // A response for a different volume must never satisfy this wait.
    fixtures::publish_response(tmpdir.path(), "pvc-B", "node-1").await?;

    let res = channel.await_response("pvc-A", POLL, Duration::from_millis(300), &mut shutdown).await;

    assert!(matches!(res, Err(ProvisionError::PlacementTimeout { .. })), "expected PlacementTimeout, got {:?}", res);
    assert!(channel.request_path("pvc-A").exists(), "expected request artifact to remain after timeout");
    assert!(channel.response_path("pvc-B").exists(), "expected unrelated response to be left untouched");
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_wait() -> Result<()> {
    let (channel, _tmpdir) = setup_channel().await?;
    let (tx, mut shutdown) = broadcast::channel(1);
    let claim = fixtures::claim("data-a", Some("1Gi"), &["ReadWriteOnce"]);
    channel.request("pvc-A", &claim).await?;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _res = tx.send(());
    });

    let res = channel.await_response("pvc-A", POLL, Duration::from_secs(30), &mut shutdown).await;

    assert!(matches!(res, Err(ProvisionError::Canceled)), "expected Canceled, got {:?}", res);
    assert!(channel.request_path("pvc-A").exists(), "expected request artifact to remain after cancellation");
    Ok(())
}
