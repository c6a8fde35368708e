//! In-process channel.
//!
//! [`LocalChannel`] runs work in the current process with the same calling
//! contract as a remote [`Channel`](crate::Channel): synchronous calls run
//! inline, asynchronous calls run on a bounded set of tasks, and the work's
//! own error arrives as [`CallError::Failed`] in both cases.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::channel::{VirtualChannel, DEFAULT_MAX_CONCURRENT_REQUESTS};
use crate::error::{CallError, ChannelError, Result};
use crate::handler::Callable;
use crate::request::{join_failure, Completion, ResponseFuture};

/// Channel that executes work in the current process.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    workers: Arc<Semaphore>,
}

impl LocalChannel {
    /// Create a local channel with the default concurrency limit.
    pub fn new() -> Self {
        Self::with_max_concurrent_requests(DEFAULT_MAX_CONCURRENT_REQUESTS)
    }

    /// Create a local channel running at most `limit` asynchronous calls at
    /// once.
    pub fn with_max_concurrent_requests(limit: usize) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Run `work` on the current task.
    pub async fn call<C: Callable>(
        &self,
        work: C,
    ) -> std::result::Result<C::Output, CallError<C::Error>> {
        work.call().await.map_err(CallError::Failed)
    }

    /// Run `work` on a worker task.
    ///
    /// A panic in the work is reported through the returned handle as
    /// [`ChannelError::RemoteFault`].
    pub async fn call_async<C: Callable>(
        &self,
        work: C,
    ) -> Result<ResponseFuture<C::Output, C::Error>> {
        let completion = Completion::new();
        let slot = completion.clone();
        let workers = self.workers.clone();

        tokio::spawn(async move {
            let result = match workers.acquire_owned().await {
                Ok(permit) => {
                    let joined = tokio::spawn(work.call()).await;
                    drop(permit);
                    match joined {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(error)) => Err(CallError::Failed(error)),
                        Err(e) => Err(CallError::Channel(join_failure(e).into())),
                    }
                }
                Err(_) => Err(CallError::Channel(ChannelError::ConnectionClosed)),
            };
            slot.complete(result);
        });

        Ok(ResponseFuture::new(completion))
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualChannel for LocalChannel {
    fn call<C: Callable>(
        &self,
        work: C,
    ) -> impl Future<Output = std::result::Result<C::Output, CallError<C::Error>>> + Send {
        LocalChannel::call(self, work)
    }

    fn call_async<C: Callable>(
        &self,
        work: C,
    ) -> impl Future<Output = Result<ResponseFuture<C::Output, C::Error>>> + Send {
        LocalChannel::call_async(self, work)
    }
}
