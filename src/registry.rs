//! Per-connection table of in-flight operations.
//!
//! Every access, including lookups surfaced to handlers through
//! `Client::get_message_by_id`, takes the same mutex. The `closing` flag
//! shares that mutex so the read loop and teardown never race on it.

use crate::message::Message;
use crate::proto::{OpKind, ProtocolOp, OID_CANCEL, OID_START_TLS};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    ops: HashMap<i32, Arc<Message>>,
    closing: bool,
}

#[derive(Default)]
pub struct OperationRegistry {
    inner: Mutex<Inner>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an operation before its worker is spawned. A client reusing a
    /// message id while the previous operation is still in flight replaces
    /// the old entry; the old worker keeps running but is no longer
    /// addressable for Abandon/Cancel.
    pub fn register(&self, message: Arc<Message>) {
        let mut inner = self.lock();
        if inner.ops.insert(message.message_id(), message).is_some() {
            tracing::warn!("duplicate in-flight message id replaced in registry");
        }
    }

    pub fn unregister(&self, message_id: i32) -> Option<Arc<Message>> {
        self.lock().ops.remove(&message_id)
    }

    pub fn get(&self, message_id: i32) -> Option<Arc<Message>> {
        self.lock().ops.get(&message_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ops.is_empty()
    }

    pub fn set_closing(&self) {
        self.lock().closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.lock().closing
    }

    /// Signal every in-flight operation. The operations are collected under
    /// the lock but signalled after it is released, so a signal can never
    /// deadlock against a handler that is itself touching the registry.
    pub fn abort_all(&self) {
        let ops: Vec<Arc<Message>> = self.lock().ops.values().cloned().collect();
        for op in ops {
            op.abandon();
        }
    }

    /// Abandon (RFC 4511 section 4.11): signal the target operation if it is
    /// abandonable; otherwise do nothing. Never produces a response.
    pub fn signal_abandon(&self, target_id: i32) {
        let target = self.get(target_id);
        match target {
            Some(op) if is_abortable(op.protocol_op()) => {
                tracing::debug!(target_id, "abandon signalled");
                op.abandon();
            }
            Some(_) => {
                tracing::debug!(target_id, "abandon of non-abandonable operation skipped");
            }
            None => {
                tracing::debug!(target_id, "abandon of unknown operation skipped");
            }
        }
    }
}

/// Operations that may be aborted via Abandon or Cancel. Bind, Abandon,
/// StartTLS and Cancel itself are excluded (RFC 3909 section 2); Unbind
/// never enters the registry.
pub(crate) fn is_abortable(op: &ProtocolOp) -> bool {
    match op.kind() {
        OpKind::Bind | OpKind::Abandon | OpKind::Unbind => false,
        OpKind::Extended => match op {
            ProtocolOp::ExtendedRequest(r) => {
                r.request_name != OID_START_TLS && r.request_name != OID_CANCEL
            }
            _ => false,
        },
        _ => true,
    }
}
