//! Correlation of in-flight calls with their responses.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stratus_core::{CallStatus, Response, StratusError, TransportError, Uuid};
use tokio::sync::{oneshot, watch};

/// Receives the terminal outcome of a call.
pub type ResultReceiver = oneshot::Receiver<Result<Response, StratusError>>;

struct PendingEntry {
    result: oneshot::Sender<Result<Response, StratusError>>,
    status: watch::Sender<Option<CallStatus>>,
}

/// Table of calls awaiting a FINISHED response.
///
/// An entry is removed the moment it resolves, so a duplicate FINISHED or a
/// late ACKNOWLEDGED/PROGRESSING for a resolved id finds nothing and is
/// ignored.
///
/// ## Example
///
/// ```rust
/// use stratus_core::{CallStatus, Response, Uuid, WireValue};
/// use stratus_transport::PendingCalls;
///
/// let pending = PendingCalls::new();
/// let id = Uuid::new_v4();
/// let (mut result, status) = pending.register(id).unwrap();
///
/// pending.dispatch(Response::acknowledged(id.to_string()));
/// assert_eq!(*status.borrow(), Some(CallStatus::Acknowledged));
///
/// pending.dispatch(Response::finished(id.to_string(), WireValue::Int(45)));
/// assert!(result.try_recv().unwrap().is_ok());
/// ```
#[derive(Default)]
pub struct PendingCalls {
    pending: DashMap<Uuid, PendingEntry>,
}

impl PendingCalls {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Register a call.
    ///
    /// The status receiver holds `None` until the first response arrives
    /// and only ever moves forward. An id that is still pending is rejected
    /// and the existing call is left untouched.
    pub fn register(
        &self,
        id: Uuid,
    ) -> Result<(ResultReceiver, watch::Receiver<Option<CallStatus>>), StratusError> {
        let Entry::Vacant(slot) = self.pending.entry(id) else {
            return Err(StratusError::DuplicateCall(id));
        };
        let (result_tx, result_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(None);
        slot.insert(PendingEntry {
            result: result_tx,
            status: status_tx,
        });
        Ok((result_rx, status_rx))
    }

    /// Route a response to its call.
    ///
    /// Returns `false` if no call with that id is pending.
    pub fn dispatch(&self, response: Response) -> bool {
        let Ok(id) = Uuid::parse_str(&response.id) else {
            tracing::warn!(id = %response.id, "Response with invalid correlation id");
            return false;
        };

        if response.is_terminal() {
            let Some((_, entry)) = self.pending.remove(&id) else {
                tracing::debug!(%id, "Ignoring FINISHED for resolved call");
                return false;
            };
            entry.status.send_replace(Some(CallStatus::Finished));
            let _ = entry.result.send(Ok(response));
            return true;
        }

        match self.pending.get(&id) {
            Some(entry) => {
                let status = response.status;
                entry.status.send_if_modified(|current| {
                    let advance = current.is_none_or(|c| (status as u8) > (c as u8));
                    if advance {
                        *current = Some(status);
                    }
                    advance
                });
                true
            }
            None => false,
        }
    }

    /// Fail a pending call.
    pub fn dispatch_error(&self, id: &Uuid, error: StratusError) -> bool {
        match self.pending.remove(id) {
            Some((_, entry)) => {
                let _ = entry.result.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Cancel a pending call so a late response is ignored.
    pub fn cancel(&self, id: &Uuid) -> bool {
        self.dispatch_error(id, StratusError::Cancelled)
    }

    /// Remove a call without resolving it.
    pub fn remove(&self, id: &Uuid) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Fail every pending call (e.g. on connection loss).
    pub fn cancel_all(&self) {
        let ids: Vec<Uuid> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.dispatch_error(&id, StratusError::Transport(TransportError::ConnectionClosed));
        }
    }

    #[must_use]
    pub fn contains(&self, id: &Uuid) -> bool {
        self.pending.contains_key(id)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl std::fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("pending", &self.pending.len())
            .finish()
    }
}
