//! One-shot acknowledgement of a triggering request

use crate::error::AcceptError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;

/// What the original caller is told about its request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AcceptResult {
    /// A flow accepted the request; its outcome is reported elsewhere
    Accepted { flow_id: Uuid },
    Rejected { reason: String },
}

pub type AcceptReceiver = oneshot::Receiver<AcceptResult>;

/// Handle used to acknowledge a request exactly once
///
/// Clones share the same one-shot sender, so whichever clone fulfils first
/// wins and every later attempt fails with [`AcceptError::AlreadyFulfilled`].
#[derive(Clone)]
pub struct AcceptHandle {
    id: Uuid,
    sender: Arc<Mutex<Option<oneshot::Sender<AcceptResult>>>>,
}

impl AcceptHandle {
    pub fn new() -> (Self, AcceptReceiver) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            id: Uuid::new_v4(),
            sender: Arc::new(Mutex::new(Some(tx))),
        };
        (handle, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_fulfilled(&self) -> bool {
        self.sender.lock().unwrap().is_none()
    }

    pub fn fulfill(&self, result: AcceptResult) -> Result<(), AcceptError> {
        let sender = self.sender.lock().unwrap().take();
        match sender {
            Some(tx) => {
                // A caller that stopped listening still counts as acknowledged
                if tx.send(result).is_err() {
                    tracing::debug!(accept_id = %self.id, "Accept receiver dropped before fulfil");
                }
                Ok(())
            }
            None => {
                tracing::error!(accept_id = %self.id, ?result, "Accept handle fulfilled twice");
                Err(AcceptError::AlreadyFulfilled(self.id))
            }
        }
    }

    /// Fulfil unless some other path already did; returns whether this call won
    pub fn fulfill_if_pending(&self, result: AcceptResult) -> bool {
        let sender = self.sender.lock().unwrap().take();
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

impl PartialEq for AcceptHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AcceptHandle {}

impl fmt::Debug for AcceptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptHandle")
            .field("id", &self.id)
            .field("fulfilled", &self.is_fulfilled())
            .finish()
    }
}
