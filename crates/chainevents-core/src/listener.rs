//! Listener traits for block, transaction, commit and disconnect callbacks.
//!
//! Callbacks run synchronously on the dispatching thread and should return
//! quickly. Returning an error (or panicking) only affects the failing
//! listener: the dispatcher logs it and carries on with the others.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::error::EventError;
use crate::types::{BlockEvent, PeerDisconnectEvent, TransactionEvent};

/// Receives every block accepted for this listener, in increasing block order.
pub trait BlockListener: Send + Sync {
    fn accept(&self, block: &BlockEvent) -> Result<(), EventError>;
}

impl<F> BlockListener for F
where
    F: Fn(&BlockEvent) -> Result<(), EventError> + Send + Sync,
{
    fn accept(&self, block: &BlockEvent) -> Result<(), EventError> {
        self(block)
    }
}

/// Receives the transactions of accepted blocks one at a time.
pub trait TransactionListener: Send + Sync {
    fn accept(&self, transaction: &TransactionEvent) -> Result<(), EventError>;
}

impl<F> TransactionListener for F
where
    F: Fn(&TransactionEvent) -> Result<(), EventError> + Send + Sync,
{
    fn accept(&self, transaction: &TransactionEvent) -> Result<(), EventError> {
        self(transaction)
    }
}

/// Receives disconnect notifications from a single peer's event service.
pub trait DisconnectListener: Send + Sync {
    fn on_disconnect(&self, event: &PeerDisconnectEvent) -> Result<(), EventError>;
}

impl<F> DisconnectListener for F
where
    F: Fn(&PeerDisconnectEvent) -> Result<(), EventError> + Send + Sync,
{
    fn on_disconnect(&self, event: &PeerDisconnectEvent) -> Result<(), EventError> {
        self(event)
    }
}

/// Observes the commit of one transaction on a set of peers.
///
/// `accept_commit` fires once per matching peer report, so a transaction
/// committed on two peers produces two calls.
pub trait CommitListener: Send + Sync {
    fn accept_commit(&self, transaction: &TransactionEvent) -> Result<(), EventError>;

    fn accept_disconnect(&self, event: &PeerDisconnectEvent) -> Result<(), EventError>;
}

/// Identity of a registered listener.
///
/// Two distinct listener values with identical behaviour get distinct keys;
/// clones of the same `Arc` share one.
pub(crate) fn listener_key<T: ?Sized>(listener: &Arc<T>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

/// Invoke one listener callback, containing its errors and panics.
///
/// Returns `true` if the callback completed successfully.
pub(crate) fn call_listener<F>(channel: &str, kind: &'static str, f: F) -> bool
where
    F: FnOnce() -> Result<(), EventError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            warn!(channel, listener = kind, %error, "Listener returned an error");
            false
        }
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            warn!(channel, listener = kind, %reason, "Listener panicked");
            false
        }
    }
}
