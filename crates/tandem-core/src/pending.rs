//! Outbound call correlation.
//!
//! Each outgoing call gets an id and a one-shot result slot. The table and
//! the id counter live behind one mutex; once the table is closed nothing can
//! register, so every slot handed out is resolved exactly once: by its
//! response, or by `close()` with `CallCancelled`.

use crate::{IpcError, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// Result delivered to a waiting caller: raw wire results or an error.
pub type CallOutcome = Result<Vec<serde_json::Value>>;

#[derive(Default)]
struct Table {
    next_id: i64,
    calls: HashMap<i64, oneshot::Sender<CallOutcome>>,
    closed: bool,
}

/// Calls sent and not yet answered.
#[derive(Default)]
pub struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id and a result slot.
    ///
    /// Fails with `CallCancelled` once the table has been closed.
    pub fn register(&self) -> Result<(i64, oneshot::Receiver<CallOutcome>)> {
        let mut table = self.lock();
        if table.closed {
            return Err(IpcError::CallCancelled);
        }
        // Ids only need to be unique among outstanding calls.
        let mut id = table.next_id;
        while table.calls.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        table.next_id = id.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        table.calls.insert(id, tx);
        Ok((id, rx))
    }

    /// Drop a slot whose call was never sent.
    pub fn deregister(&self, id: i64) {
        self.lock().calls.remove(&id);
    }

    /// Deliver the outcome of call `id`.
    ///
    /// Returns `false` if no call with that id is outstanding.
    pub fn resolve(&self, id: i64, outcome: CallOutcome) -> bool {
        let sender = self.lock().calls.remove(&id);
        match sender {
            Some(tx) => {
                // The caller may have given up waiting; nothing to deliver to then.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Close the table and cancel every outstanding call.
    ///
    /// Returns the number of calls cancelled; zero on repeated calls.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut table = self.lock();
            table.closed = true;
            table.calls.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(IpcError::CallCancelled));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }
}
