//! Operational logger
//!
//! Errors worth an operator's attention are emitted as ERROR events tagged
//! with an `op_kind` field. [`RemoteLogLayer`] picks those events out of the
//! tracing stream, suppresses messages it has already forwarded and hands
//! the rest to a background task that ships them to the control plane.
//!
//! Account errors are only emitted when their message contains one of the
//! configured attention texts; system errors are always emitted.

use crate::control::{ControlPlane, LogEntry};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// `op_kind` of errors scoped to one account and resource type
pub const ACCOUNT: &str = "ACCOUNT";
/// `op_kind` of process-wide errors
pub const SYSTEM: &str = "SYSTEM";

/// Lists longer than this are matched in parallel
const SEQUENTIAL_MATCH_LIMIT: usize = 30;
const MATCH_WORKERS: usize = 4;

/// Error codes prefixed to operational messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Engine-side failure around a collector: init, projection, allow-list
    Collector,
    /// Error returned by a cancellable collector's provider calls
    Sdk,
    /// Panic inside a collector
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collector => f.write_str("CollectorError"),
            Self::Sdk => f.write_str("SDKError"),
            Self::Unknown => f.write_str("UnknownError"),
        }
    }
}

// ===== Attention matching =====

/// Substring matcher over the configured attention texts
#[derive(Debug, Clone, Default)]
pub struct AttentionMatcher {
    texts: Arc<Vec<String>>,
}

impl AttentionMatcher {
    /// Empty and repeated texts are dropped, first occurrence order kept
    pub fn new(texts: Vec<String>) -> Self {
        let mut seen = HashSet::new();
        let texts = texts
            .into_iter()
            .filter(|t| !t.is_empty() && seen.insert(t.clone()))
            .collect();
        Self {
            texts: Arc::new(texts),
        }
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// An attention text contained in `message`, if any.
    ///
    /// Large lists are split across worker threads and the first match to
    /// arrive wins, so which text is returned is not deterministic when
    /// several match.
    pub fn find(&self, message: &str) -> Option<String> {
        if self.texts.len() <= SEQUENTIAL_MATCH_LIMIT {
            return self
                .texts
                .iter()
                .find(|t| message.contains(t.as_str()))
                .cloned();
        }

        let chunk_size = self.texts.len().div_ceil(MATCH_WORKERS);
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::scope(|scope| {
            for chunk in self.texts.chunks(chunk_size) {
                let tx = tx.clone();
                scope.spawn(move || {
                    if let Some(text) = chunk.iter().find(|t| message.contains(t.as_str())) {
                        let _ = tx.send(text.clone());
                    }
                });
            }
            drop(tx);
            rx.recv().ok()
        })
    }
}

// ===== Logger =====

/// Emits operational errors into the tracing stream
#[derive(Debug, Clone, Default)]
pub struct OperationalLogger {
    matcher: AttentionMatcher,
}

impl OperationalLogger {
    pub fn new(matcher: AttentionMatcher) -> Self {
        Self { matcher }
    }

    /// Report an account error when it matches an attention text.
    /// Returns whether it was reported.
    pub fn log_account_error(
        &self,
        platform: &str,
        resource_type: &str,
        cloud_account_id: &str,
        message: &str,
    ) -> bool {
        let Some(description) = self.matcher.find(message) else {
            return false;
        };

        let unique_key = [ACCOUNT, platform, resource_type, cloud_account_id, &description].join("|");
        tracing::error!(
            op_kind = ACCOUNT,
            platform,
            resource_type,
            cloud_account_id,
            unique_key = %unique_key,
            description = %description,
            "{}",
            message
        );
        true
    }

    pub fn log_system_error(&self, message: &str) {
        let unique_key = [SYSTEM, message].join("|");
        tracing::error!(
            op_kind = SYSTEM,
            unique_key = %unique_key,
            description = message,
            "{}",
            message
        );
    }
}

// ===== Remote forwarding layer =====

/// Visitor collecting the fields of an operational event
#[derive(Default)]
struct OpLogVisitor {
    message: String,
    op_kind: Option<String>,
    unique_key: String,
    description: String,
    platform: Option<String>,
    resource_type: Option<String>,
    cloud_account_id: Option<String>,
}

impl OpLogVisitor {
    fn set(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "op_kind" => self.op_kind = Some(value),
            "unique_key" => self.unique_key = value,
            "description" => self.description = value,
            "platform" => self.platform = Some(value),
            "resource_type" => self.resource_type = Some(value),
            "cloud_account_id" => self.cloud_account_id = Some(value),
            _ => {}
        }
    }
}

impl Visit for OpLogVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let mut out = String::new();
        write!(&mut out, "{:?}", value).ok();
        self.set(field, out);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field, value.to_string());
    }
}

/// Clears the layer's record of already forwarded messages
#[derive(Debug, Clone)]
pub struct RemoteLogHandle {
    sent: Arc<Mutex<HashSet<String>>>,
}

impl RemoteLogHandle {
    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

/// Tracing layer forwarding deduplicated operational errors
#[derive(Debug, Clone)]
pub struct RemoteLogLayer {
    sent: Arc<Mutex<HashSet<String>>>,
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl RemoteLogLayer {
    /// Layer, its dedup handle, and the receiving end of forwarded entries
    pub fn new() -> (Self, RemoteLogHandle, mpsc::UnboundedReceiver<LogEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(HashSet::new()));
        let handle = RemoteLogHandle { sent: sent.clone() };
        (Self { sent, tx }, handle, rx)
    }
}

impl<S> Layer<S> for RemoteLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR || self.tx.is_closed() {
            return;
        }

        let mut visitor = OpLogVisitor::default();
        event.record(&mut visitor);
        let Some(kind) = visitor.op_kind else {
            return;
        };

        if !self.sent.lock().insert(visitor.message.clone()) {
            return;
        }

        let entry = LogEntry {
            level: "error".to_string(),
            time: Utc::now().to_rfc3339(),
            message: visitor.message,
            kind,
            unique_key: visitor.unique_key,
            description: visitor.description,
            platform: visitor.platform,
            resource_type: visitor.resource_type,
            cloud_account_id: visitor.cloud_account_id,
        };
        // Receiver gone means remote logging is off
        let _ = self.tx.send(entry);
    }
}

/// Ship forwarded entries until every layer is dropped
pub async fn forward_remote_logs(
    mut rx: mpsc::UnboundedReceiver<LogEntry>,
    client: Arc<dyn ControlPlane>,
) {
    while let Some(entry) = rx.recv().await {
        if let Err(e) = client.send_log(&entry).await {
            // Not at ERROR, so this never loops back into the layer
            tracing::warn!("Failed to send operational log: {:#}", e);
        }
    }
}
