use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::record::{JobStatus, RecordKind};
use crate::utils::now_string;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconcileReason {
    /// The subject's exit code marker holds a non-zero value.
    ExitCode { code: i32 },
    /// The job log contains an error marker.
    ErrorMarker,
    /// Process gone without any evidence of failure.
    NoEvidence,
    /// Found dead while reconciling after a restart.
    DeadAtStartup,
    /// A matching child process was running without a record.
    OrphanAdopted,
}

/// A status change made outside the job's own supervisor.
#[derive(Clone, Debug, Serialize)]
pub struct ReconcileEvent {
    pub key: String,
    pub kind: RecordKind,
    pub subject: String,
    pub pid: u32,
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub reason: ReconcileReason,
    pub at: String,
}

impl ReconcileEvent {
    pub fn new(
        key: &str,
        kind: RecordKind,
        subject: &str,
        pid: u32,
        from: Option<JobStatus>,
        to: JobStatus,
        reason: ReconcileReason,
    ) -> Self {
        Self {
            key: key.to_string(),
            kind,
            subject: subject.to_string(),
            pid,
            from,
            to,
            reason,
            at: now_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ReconcileEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(200);
        Self { tx }
    }

    pub fn emit(&self, event: ReconcileEvent) {
        info!(
            key = %event.key,
            subject = %event.subject,
            pid = event.pid,
            from = event.from.map(|status| status.as_str()).unwrap_or("none"),
            to = event.to.as_str(),
            reason = ?event.reason,
            "Reconciled record"
        );
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.tx.subscribe()
    }
}
