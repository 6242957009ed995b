//! Kubernetes controller.
//!
//! This controller observes claims and volumes cluster-wide and drives the provisioner for the
//! ones which belong to it. Claims whose storage class names this provisioner are provisioned;
//! released volumes created by this provisioner are deleted when their reclaim policy says so.
//!
//! Each lifecycle operation is executed in its own spawned task, as a single operation may block
//! for as long as the placement timeout. A volume name is never handled by more than one task at
//! a time.

mod data;
mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use futures::prelude::*;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::k8s::scheduler::SchedulerTask;
use crate::provisioner::Provisioner;

/// The timeout duration used before rescheduling a scheduler task.
const RESCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);
/// The maximum duration to wait for in-flight operations during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

const METRIC_WATCHER_ERRORS: &str = "vcd_provisioner_watcher_errors";

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// The set of volume names which currently have an operation in flight.
type InFlight = Arc<DashMap<String, ()>>;

/// Kubernetes controller for watching claims & volumes.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// The provisioner driven by this controller.
    provisioner: Provisioner,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of scheduler tasks.
    scheduler_tasks_tx: mpsc::Sender<SchedulerTask>,
    /// A channel of scheduler tasks.
    scheduler_tasks_rx: ReceiverStream<SchedulerTask>,

    /// Volume names with an operation in flight.
    in_flight: InFlight,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, provisioner: Provisioner, shutdown_tx: broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_WATCHER_ERRORS, metrics::Unit::Count, "k8s watcher errors from the claim & volume watchers");
        let (scheduler_tasks_tx, scheduler_tasks_rx) = mpsc::channel(1000);
        Self {
            client,
            provisioner,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            scheduler_tasks_tx,
            scheduler_tasks_rx: ReceiverStream::new(scheduler_tasks_rx),
            in_flight: Default::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        // Build watcher streams.
        let claims: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let claims_watcher = watcher(claims, ListParams::default());
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let volumes_watcher = watcher(volumes, ListParams::default());
        tokio::pin!(claims_watcher, volumes_watcher);

        tracing::info!(provisioner = self.provisioner.name(), "k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = claims_watcher.next() => self.handle_claim_event(k8s_event_res).await,
                Some(k8s_event_res) = volumes_watcher.next() => self.handle_volume_event(k8s_event_res).await,
                Some(scheduler_task) = self.scheduler_tasks_rx.next() => self.handle_scheduler_task(scheduler_task),
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutting down");
        // Give in-flight operations the chance to observe shutdown and release their volumes.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.in_flight.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !self.in_flight.is_empty() {
            tracing::warn!(count = self.in_flight.len(), "k8s controller shutting down with operations in flight");
        }
        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Spawn a task which emits a new scheduler task.
    fn spawn_scheduler_task(&self, task: SchedulerTask, is_retry: bool) {
        emit_scheduler_task(self.scheduler_tasks_tx.clone(), self.shutdown_tx.subscribe(), task, is_retry);
    }
}

/// Spawn a task which emits a new scheduler task, delaying first if the task is a retry.
///
/// This indirection is used to ensure that we don't use an unlimited amount of memory with an
/// unbounded queue, and also so that we do not block the controller from making progress and
/// dead-locking when we hit the scheduler task queue cap.
fn emit_scheduler_task(tx: mpsc::Sender<SchedulerTask>, mut shutdown: broadcast::Receiver<()>, task: SchedulerTask, is_retry: bool) {
    tokio::spawn(async move {
        if is_retry {
            tokio::select! {
                _ = tokio::time::sleep(RESCHEDULE_TIMEOUT) => (),
                _ = shutdown.recv() => return,
            }
        }
        let _res = tx.send(task).await;
    });
}
