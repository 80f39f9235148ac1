use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Scanning,
    Complete,
    Canceled,
}

/// A status line for whoever is watching a scan.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub message: String,
    pub phase: Phase,
}

/// Sink for notifications. Forwarding them to live subscribers is the host's job.
pub type Notifier = Arc<dyn Fn(Notification) + Send + Sync>;

/// Notifier that only writes to the log.
pub fn log_notifier() -> Notifier {
    Arc::new(|n: Notification| log::info!("[{:?}] {}", n.phase, n.message))
}

pub(crate) fn emit(notifier: &Notifier, message: impl Into<String>, phase: Phase) {
    (notifier)(Notification {
        message: message.into(),
        phase,
    });
}
