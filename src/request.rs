//! Request/response correlation.
//!
//! Every outgoing call gets a channel-unique ID and a pending entry. The
//! entry is completed by the matching response, or aborted when the channel
//! terminates, whichever comes first; registration and the termination sweep
//! take the same lock, so a call can never slip in after the sweep and hang.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinError;

use crate::codec::MsgPackCodec;
use crate::error::{CallError, ChannelError, Result};

/// Request ID, unique per channel and direction.
pub type RequestId = u32;

/// Result of executing a request, as carried by a Response command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// The work returned normally; MsgPack-encoded `Output`.
    Value(Bytes),
    /// The work returned its own error; MsgPack-encoded `Error`.
    Failure(Bytes),
    /// The work could not be run or its result could not be produced.
    Fault(Fault),
}

/// Failures outside the work's own error type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fault {
    /// No callable is registered under the requested name.
    UnknownCallable(String),
    /// The work or its result could not be (de)serialized.
    Malformed(String),
    /// The work panicked.
    Panicked(String),
    /// The channel terminated before a response was received.
    Aborted(String),
}

impl Outcome {
    /// Encode a successful value.
    pub fn value<T: Serialize>(value: &T) -> Self {
        match MsgPackCodec::encode(value) {
            Ok(bytes) => Outcome::Value(bytes.into()),
            Err(e) => Outcome::Fault(Fault::Malformed(format!("unable to encode result: {e}"))),
        }
    }

    /// Encode the work's own error.
    pub fn failure<E: Serialize>(error: &E) -> Self {
        match MsgPackCodec::encode(error) {
            Ok(bytes) => Outcome::Failure(bytes.into()),
            Err(e) => Outcome::Fault(Fault::Malformed(format!("unable to encode error: {e}"))),
        }
    }

    /// Whether the outcome is anything other than a value.
    pub fn is_error(&self) -> bool {
        !matches!(self, Outcome::Value(_))
    }

    /// Decode into the caller's typed result.
    pub fn decode<T, E>(self) -> std::result::Result<T, CallError<E>>
    where
        T: DeserializeOwned,
        E: DeserializeOwned,
    {
        match self {
            Outcome::Value(bytes) => Ok(MsgPackCodec::decode(&bytes)?),
            Outcome::Failure(bytes) => Err(CallError::Failed(MsgPackCodec::decode(&bytes)?)),
            Outcome::Fault(fault) => Err(CallError::Channel(fault.into())),
        }
    }
}

impl From<Fault> for ChannelError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::UnknownCallable(name) => ChannelError::UnknownCallable(name),
            Fault::Malformed(msg) => ChannelError::RemoteFault(msg),
            Fault::Panicked(msg) => ChannelError::RemoteFault(format!("work panicked: {msg}")),
            Fault::Aborted(reason) => ChannelError::RequestAborted(reason),
        }
    }
}

/// Describe a failed task join.
pub(crate) fn join_failure(err: JoinError) -> Fault {
    if err.is_cancelled() {
        return Fault::Aborted("work was cancelled".to_string());
    }
    let panic = err.into_panic();
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    Fault::Panicked(message)
}

enum Slot<R> {
    Pending,
    Ready(R),
    Taken,
}

/// One-shot completion slot that can be waited on repeatedly until the
/// value is taken.
pub(crate) struct Completion<R> {
    slot: Mutex<Slot<R>>,
    notify: Notify,
}

impl<R> Completion<R> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot::Pending),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot<R>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store the value. Only the first completion counts.
    pub(crate) fn complete(&self, value: R) -> bool {
        {
            let mut slot = self.lock();
            if !matches!(*slot, Slot::Pending) {
                return false;
            }
            *slot = Slot::Ready(value);
        }
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn is_done(&self) -> bool {
        !matches!(*self.lock(), Slot::Pending)
    }

    /// Wait for the value and take it. `None` if it was already taken.
    ///
    /// Cancel safe: dropping the future leaves the slot untouched.
    pub(crate) async fn take(&self) -> Option<R> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut slot = self.lock();
                match std::mem::replace(&mut *slot, Slot::Taken) {
                    Slot::Ready(value) => return Some(value),
                    Slot::Taken => return None,
                    Slot::Pending => *slot = Slot::Pending,
                }
            }
            notified.await;
        }
    }
}

/// Handle to the eventual result of an asynchronous call.
///
/// The result can be taken once, with [`get`](Self::get) or a successful
/// [`get_timeout`](Self::get_timeout). A timed-out `get_timeout` leaves the
/// handle usable.
pub struct ResponseFuture<T, E> {
    completion: Arc<Completion<std::result::Result<T, CallError<E>>>>,
}

impl<T, E> ResponseFuture<T, E> {
    pub(crate) fn new(completion: Arc<Completion<std::result::Result<T, CallError<E>>>>) -> Self {
        Self { completion }
    }

    /// Whether the call has completed (successfully or not).
    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    /// Wait for the result.
    pub async fn get(self) -> std::result::Result<T, CallError<E>> {
        self.completion
            .take()
            .await
            .unwrap_or_else(|| Err(ChannelError::Consumed.into()))
    }

    /// Wait at most `timeout` for the result.
    ///
    /// On timeout the call keeps running and the result can still be
    /// collected later.
    pub async fn get_timeout(&self, timeout: Duration) -> std::result::Result<T, CallError<E>> {
        match tokio::time::timeout(timeout, self.completion.take()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(ChannelError::Consumed.into()),
            Err(_) => Err(ChannelError::Timeout(timeout).into()),
        }
    }
}

impl<T, E> fmt::Debug for ResponseFuture<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Callback that completes a pending call.
pub(crate) type Completer = Box<dyn FnOnce(Outcome) + Send>;

/// Completer for a typed caller: decodes the outcome into its slot.
pub(crate) fn typed_completer<T, E>(
    completion: Arc<Completion<std::result::Result<T, CallError<E>>>>,
) -> Completer
where
    T: DeserializeOwned + Send + 'static,
    E: DeserializeOwned + Send + 'static,
{
    Box::new(move |outcome: Outcome| {
        completion.complete(outcome.decode());
    })
}

/// Pending-request table of one channel.
pub(crate) struct PendingCalls {
    calls: HashMap<RequestId, Completer>,
    closed: Option<String>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            calls: HashMap::new(),
            closed: None,
        }
    }

    /// Register a completer, unless the channel already terminated.
    pub(crate) fn register(&mut self, id: RequestId, completer: Completer) -> Result<()> {
        if let Some(reason) = &self.closed {
            return Err(ChannelError::RequestAborted(reason.clone()));
        }
        if self.calls.contains_key(&id) {
            return Err(ChannelError::Protocol(format!(
                "request id {id} is already pending"
            )));
        }
        self.calls.insert(id, completer);
        Ok(())
    }

    pub(crate) fn take(&mut self, id: RequestId) -> Option<Completer> {
        self.calls.remove(&id)
    }

    /// Mark the table closed and hand back every pending completer.
    ///
    /// Returns `None` if it was already closed.
    pub(crate) fn close(&mut self, reason: &str) -> Option<Vec<Completer>> {
        if self.closed.is_some() {
            return None;
        }
        self.closed = Some(reason.to_string());
        Some(self.calls.drain().map(|(_, completer)| completer).collect())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}
