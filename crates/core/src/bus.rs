//! In-process pub/sub event bus.
//!
//! Two subscription modes: **typed** (one event name) and **firehose**
//! (every event). Delivery is best-effort and synchronous: handlers for a
//! single publish run sequentially in subscription order, typed handlers
//! before firehose handlers, with the subscriber table locked across the
//! iteration. A handler that fails is logged and skipped; it never aborts
//! the publish. There is no persistence and no replay.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use maestro_domain::Result;

/// Predefined topic names published by the core stores and the
/// orchestrator.
pub mod topics {
    pub const SESSION_CREATED: &str = "session.created";
    pub const SESSION_UPDATED: &str = "session.updated";
    pub const SESSION_DELETED: &str = "session.deleted";

    pub const MESSAGE_UPDATED: &str = "message.updated";
    pub const MESSAGE_REMOVED: &str = "message.removed";

    pub const PART_UPDATED: &str = "part.updated";
    pub const PART_REMOVED: &str = "part.removed";

    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_FINISHED: &str = "step.finished";

    pub const TOOL_STATE_CHANGED: &str = "tool.state.changed";

    pub const QUESTION_ASKED: &str = "question.asked";
    pub const QUESTION_REPLIED: &str = "question.replied";
    pub const QUESTION_REJECTED: &str = "question.rejected";
}

/// An event instance: a type name plus an opaque JSON payload.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Opaque handle returned by `subscribe`/`subscribe_all`, used to
/// unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn Fn(&BusEvent) -> Result<()> + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    handler: Handler,
}

#[derive(Default)]
struct SubscriberTables {
    typed: HashMap<String, Vec<Subscriber>>,
    firehose: Vec<Subscriber>,
    next_id: u64,
}

/// The bus itself. Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Default)]
pub struct EventBus {
    tables: Mutex<SubscriberTables>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event to typed subscribers of `event_type`, then to the
    /// firehose, in subscription order.
    pub fn publish(&self, event_type: &str, payload: serde_json::Value) {
        let event = BusEvent {
            event_type: event_type.to_owned(),
            payload,
        };

        let tables = self.tables.lock();
        if let Some(subs) = tables.typed.get(event_type) {
            for sub in subs {
                if let Err(e) = (sub.handler)(&event) {
                    tracing::warn!(
                        event_type = event_type,
                        error = %e,
                        "event subscriber failed; skipping"
                    );
                }
            }
        }
        for sub in &tables.firehose {
            if let Err(e) = (sub.handler)(&event) {
                tracing::warn!(
                    event_type = event_type,
                    error = %e,
                    "firehose subscriber failed; skipping"
                );
            }
        }
    }

    /// Subscribe to a single event type.
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) -> Result<()> + Send + Sync + 'static,
    {
        let mut tables = self.tables.lock();
        let id = SubscriptionId(tables.next_id);
        tables.next_id += 1;
        tables
            .typed
            .entry(event_type.to_owned())
            .or_default()
            .push(Subscriber {
                id,
                handler: Box::new(handler),
            });
        id
    }

    /// Subscribe to every event.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) -> Result<()> + Send + Sync + 'static,
    {
        let mut tables = self.tables.lock();
        let id = SubscriptionId(tables.next_id);
        tables.next_id += 1;
        tables.firehose.push(Subscriber {
            id,
            handler: Box::new(handler),
        });
        id
    }

    /// Remove a subscription. Unknown IDs are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut tables = self.tables.lock();
        for subs in tables.typed.values_mut() {
            subs.retain(|s| s.id != id);
        }
        tables.firehose.retain(|s| s.id != id);
    }

    /// Drop every subscriber.
    pub fn clear(&self) {
        let mut tables = self.tables.lock();
        tables.typed.clear();
        tables.firehose.clear();
    }

    /// Subscribe to one event type through an unbounded channel. The
    /// receiver sees events in publish order; dropping it ends delivery at
    /// the next publish (the send error is swallowed by the handler).
    pub fn subscribe_channel(
        &self,
        event_type: &str,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(event_type, move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        });
        (id, rx)
    }

    /// Firehose variant of [`subscribe_channel`](Self::subscribe_channel).
    /// This is how an SSE gateway attaches.
    pub fn firehose_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe_all(move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        });
        (id, rx)
    }
}
