use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::types::{PipelineEvent, PipelineEventType};

/// Typed publish/subscribe with append-only JSONL persistence per request id.
///
/// Persistence precedes dispatch: a subscriber never sees an event that is
/// not already on disk. Each subscriber gets its own unbounded channel, so a
/// slow consumer backs up its own queue without stalling the publisher or
/// the other subscribers. Delivery order per request id is publish order.
pub struct EventBus {
    events_dir: PathBuf,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

struct Subscriber {
    id: u64,
    /// None = all event types.
    types: Option<HashSet<PipelineEventType>>,
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

/// A live subscription. Dropping the receiver detaches it lazily; call
/// `EventBus::unsubscribe` with `id` for an eager detach.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<PipelineEvent>,
}

impl EventBus {
    pub fn new(events_dir: impl Into<PathBuf>) -> Self {
        let events_dir = events_dir.into();
        if let Err(e) = std::fs::create_dir_all(&events_dir) {
            warn!("create events dir {}: {e}", events_dir.display());
        }
        Self {
            events_dir,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append the event to the request's JSONL log, then fan it out to every
    /// current subscriber in registration order. A persistence failure is
    /// logged but never blocks dispatch.
    pub async fn publish(&self, event: PipelineEvent) {
        if let Err(e) = self.append(&event).await {
            error!(request_id = %event.request_id, "persist event {}: {e}", event.event_type);
        }
        let mut subs = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|s| {
            let wanted = s.types.as_ref().map_or(true, |t| t.contains(&event.event_type));
            if !wanted {
                return true;
            }
            // A send failure means the receiver was dropped; detach it.
            s.tx.send(event.clone()).is_ok()
        });
    }

    /// Subscribe to every event type.
    pub fn subscribe(&self) -> Subscription {
        self.add_subscriber(None)
    }

    /// Subscribe to a set of event types.
    pub fn subscribe_types(&self, types: &[PipelineEventType]) -> Subscription {
        self.add_subscriber(Some(types.iter().copied().collect()))
    }

    fn add_subscriber(&self, types: Option<HashSet<PipelineEventType>>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.push(Subscriber { id, types, tx });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subs = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|s| s.id != id);
    }

    /// Read back the persisted sequence for a request, in file order.
    /// Corrupt lines are skipped so one bad event never loses the log.
    pub async fn events_for(&self, request_id: &str) -> Result<Vec<PipelineEvent>> {
        let path = self.log_path(request_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let mut events = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PipelineEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(request_id, "skipping corrupt event at line {}: {e}", idx + 1),
            }
        }
        Ok(events)
    }

    async fn append(&self, event: &PipelineEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).context("serialize event")?;
        line.push('\n');
        let path = self.log_path(&event.request_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(line.as_bytes()).await.context("append event")?;
        Ok(())
    }

    fn log_path(&self, request_id: &str) -> PathBuf {
        self.events_dir.join(format!("{}.jsonl", sanitize_id(request_id)))
    }
}

/// Request ids become file names; anything outside [A-Za-z0-9._-] is mapped
/// to '_' so a hostile id cannot escape the events directory.
fn sanitize_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".into()
    } else {
        cleaned
    }
}
