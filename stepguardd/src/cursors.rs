//! Server-side cursors.
//!
//! A cursor owns a snapshot of the documents its find matched. A getMore pins
//! the cursor for its whole duration; a second getMore on a pinned cursor is
//! rejected with `CursorInUse`. If the pinning operation never completes its
//! batch (it was interrupted or its connection dropped) the cursor is
//! destroyed when the pin is released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use stepguard_common::protocol::{CursorReply, ServerError, ServerErrorCode};
use stepguard_common::types::{CursorId, Document, Namespace};
use tracing::debug;

struct CursorState {
    ns: Namespace,
    remaining: VecDeque<Document>,
    pinned: bool,
}

#[derive(Default)]
pub struct CursorManager {
    cursors: Mutex<HashMap<u64, CursorState>>,
    next_id: AtomicU64,
}

impl CursorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the first batch of a find.
    ///
    /// The cursor is kept open when documents remain, and always for a batch
    /// size of zero.
    pub fn open(&self, ns: Namespace, docs: Vec<Document>, batch_size: u32) -> CursorReply {
        let mut remaining: VecDeque<Document> = docs.into();
        let take = (batch_size as usize).min(remaining.len());
        let batch: Vec<Document> = remaining.drain(..take).collect();

        if remaining.is_empty() && batch_size != 0 {
            return CursorReply {
                id: CursorId::EXHAUSTED,
                ns,
                batch,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(cursor_id = id, ns = %ns, remaining = remaining.len(), "Cursor opened");
        self.lock().insert(
            id,
            CursorState {
                ns: ns.clone(),
                remaining,
                pinned: false,
            },
        );
        CursorReply {
            id: CursorId(id),
            ns,
            batch,
        }
    }

    /// Pin a cursor for one getMore.
    pub fn pin(self: &Arc<Self>, id: CursorId, ns: &Namespace) -> Result<PinGuard, ServerError> {
        let mut cursors = self.lock();
        let Some(cursor) = cursors.get_mut(&id.0) else {
            return Err(not_found(id));
        };
        if &cursor.ns != ns {
            return Err(ServerError::new(
                ServerErrorCode::Unauthorized,
                format!(
                    "Requested getMore on namespace '{ns}', but cursor belongs to a different namespace {}",
                    cursor.ns
                ),
            ));
        }
        if cursor.pinned {
            return Err(ServerError::new(
                ServerErrorCode::CursorInUse,
                format!("cursor id {id} is already in use"),
            ));
        }
        cursor.pinned = true;
        Ok(PinGuard {
            manager: Arc::clone(self),
            id,
            completed: false,
        })
    }

    /// Kill cursors by id, returning `(killed, not_found)`.
    pub fn kill(&self, ns: &Namespace, ids: &[CursorId]) -> (Vec<CursorId>, Vec<CursorId>) {
        let mut cursors = self.lock();
        let mut killed = Vec::new();
        let mut missing = Vec::new();
        for id in ids {
            let matches = cursors.get(&id.0).is_some_and(|c| &c.ns == ns);
            if matches {
                cursors.remove(&id.0);
                killed.push(*id);
            } else {
                missing.push(*id);
            }
        }
        (killed, missing)
    }

    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CursorState>> {
        self.cursors.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn not_found(id: CursorId) -> ServerError {
    ServerError::new(
        ServerErrorCode::CursorNotFound,
        format!("cursor id {id} not found"),
    )
}

/// Exclusive use of a cursor by one getMore.
pub struct PinGuard {
    manager: Arc<CursorManager>,
    id: CursorId,
    completed: bool,
}

impl PinGuard {
    /// Take the next batch and release the pin. `None` drains every remaining document.
    pub fn next_batch(mut self, batch_size: Option<u32>) -> Result<CursorReply, ServerError> {
        let mut cursors = self.manager.lock();
        // The cursor may have been killed while pinned.
        let Some(cursor) = cursors.get_mut(&self.id.0) else {
            self.completed = true;
            return Err(not_found(self.id));
        };

        let take = batch_size
            .map_or(cursor.remaining.len(), |n| n as usize)
            .min(cursor.remaining.len());
        let batch: Vec<Document> = cursor.remaining.drain(..take).collect();
        let ns = cursor.ns.clone();

        let id = if cursor.remaining.is_empty() {
            cursors.remove(&self.id.0);
            debug!(cursor_id = self.id.0, "Cursor exhausted");
            CursorId::EXHAUSTED
        } else {
            cursor.pinned = false;
            self.id
        };
        drop(cursors);
        self.completed = true;
        Ok(CursorReply { id, ns, batch })
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if !self.completed {
            debug!(cursor_id = self.id.0, "Destroying cursor of abandoned getMore");
            self.manager.lock().remove(&self.id.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("test", "coll")
    }

    fn docs(n: i64) -> Vec<Document> {
        (0..n).map(|i| json!({"_id": i})).collect()
    }

    #[test]
    fn test_zero_batch_keeps_cursor_open() {
        let manager = CursorManager::new();
        let reply = manager.open(ns(), docs(1), 0);
        assert!(reply.batch.is_empty());
        assert!(!reply.id.is_exhausted());
        assert_eq!(manager.open_count(), 1);
    }

    #[test]
    fn test_single_batch_exhausts() {
        let manager = CursorManager::new();
        let reply = manager.open(ns(), docs(2), 101);
        assert_eq!(reply.batch.len(), 2);
        assert!(reply.id.is_exhausted());
        assert_eq!(manager.open_count(), 0);
    }

    #[test]
    fn test_get_more_drains_and_removes() {
        let manager = Arc::new(CursorManager::new());
        let reply = manager.open(ns(), docs(3), 1);
        let pin = manager.pin(reply.id, &ns()).unwrap();
        let next = pin.next_batch(Some(1)).unwrap();
        assert_eq!(next.id, reply.id);
        let last = manager.pin(reply.id, &ns()).unwrap().next_batch(None).unwrap();
        assert!(last.id.is_exhausted());
        assert_eq!(last.batch, vec![json!({"_id": 2})]);
        assert_eq!(manager.open_count(), 0);
    }

    #[test]
    fn test_concurrent_pin_is_cursor_in_use() {
        let manager = Arc::new(CursorManager::new());
        let reply = manager.open(ns(), docs(1), 0);
        let _pin = manager.pin(reply.id, &ns()).unwrap();
        let err = manager.pin(reply.id, &ns()).err().unwrap();
        assert_eq!(err.code_name, ServerErrorCode::CursorInUse);
    }

    #[test]
    fn test_wrong_namespace_is_rejected() {
        let manager = Arc::new(CursorManager::new());
        let reply = manager.open(ns(), docs(1), 0);
        let err = manager
            .pin(reply.id, &Namespace::new("test", "other"))
            .err()
            .unwrap();
        assert_eq!(err.code_name, ServerErrorCode::Unauthorized);
    }

    #[test]
    fn test_abandoned_pin_destroys_cursor() {
        let manager = Arc::new(CursorManager::new());
        let reply = manager.open(ns(), docs(1), 0);
        drop(manager.pin(reply.id, &ns()).unwrap());
        let err = manager.pin(reply.id, &ns()).err().unwrap();
        assert_eq!(err.code_name, ServerErrorCode::CursorNotFound);
    }

    #[test]
    fn test_kill_reports_missing() {
        let manager = CursorManager::new();
        let reply = manager.open(ns(), docs(1), 0);
        let (killed, missing) = manager.kill(&ns(), &[reply.id, CursorId(999)]);
        assert_eq!(killed, vec![reply.id]);
        assert_eq!(missing, vec![CursorId(999)]);
    }

    proptest! {
        #[test]
        fn test_batches_partition_the_result_set(
            n in 0i64..40,
            first in 0u32..5,
            sizes in prop::collection::vec(1u32..8, 1..16),
        ) {
            let manager = Arc::new(CursorManager::new());
            let mut reply = manager.open(ns(), docs(n), first);
            let mut seen = reply.batch.clone();
            let mut turn = 0;
            while !reply.id.is_exhausted() {
                let pin = manager.pin(reply.id, &ns()).unwrap();
                reply = pin.next_batch(Some(sizes[turn % sizes.len()])).unwrap();
                seen.extend(reply.batch.iter().cloned());
                turn += 1;
            }
            prop_assert_eq!(seen, docs(n));
            prop_assert_eq!(manager.open_count(), 0);
        }
    }
}
