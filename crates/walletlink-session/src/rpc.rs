//! RPC engine -- correlated request/response over an encrypted channel.
//!
//! Outgoing calls get a fresh id and a pending entry (allocated and inserted
//! under one lock) before the request is sent. A background receive loop
//! completes entries by id and dispatches inbound requests to the local
//! handler. When the loop stops, every pending call fails with
//! `ChannelClosed`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use walletlink_protocol::{RequestId, RpcErrorObject, RpcMessage, RpcRequest, RpcResponse};

use crate::channel::{ChannelError, EncryptedChannel};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("call timed out after {0:?}")]
    TimedOut(Duration),
    #[error("channel closed")]
    ChannelClosed,
    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<RpcErrorObject> for RpcError {
    fn from(e: RpcErrorObject) -> Self {
        RpcError::Remote {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcErrorObject>> + Send>>;

/// Serves requests the peer sends to us.
pub type RequestHandler = Arc<dyn Fn(RpcRequest) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`RequestHandler`].
pub fn handler_fn<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcErrorObject>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

type Completion = oneshot::Sender<Result<Value, RpcError>>;

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

struct PendingTable {
    next_id: RequestId,
    calls: HashMap<RequestId, Completion>,
    closed: bool,
}

struct Shared {
    channel: Arc<EncryptedChannel>,
    pending: StdMutex<PendingTable>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn complete(&self, response: RpcResponse) {
        let id = response.id;
        match self.table().calls.remove(&id) {
            Some(completion) => {
                let _ = completion.send(response.into_result().map_err(RpcError::from));
            }
            None => {
                tracing::debug!(id, "discarding response with no pending call");
            }
        }
    }

    fn forget(&self, id: RequestId) {
        self.table().calls.remove(&id);
    }

    fn fail_all(&self) {
        let drained: Vec<Completion> = {
            let mut table = self.table();
            table.closed = true;
            table.calls.drain().map(|(_, completion)| completion).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending calls: channel closed");
        }
        for completion in drained {
            let _ = completion.send(Err(RpcError::ChannelClosed));
        }
    }
}

/// An outstanding call. Dropping it (or calling [`PendingCall::cancel`])
/// removes the pending entry; a response arriving later is discarded.
pub struct PendingCall {
    id: RequestId,
    deadline: Instant,
    timeout: Duration,
    completion: oneshot::Receiver<Result<Value, RpcError>>,
    shared: Weak<Shared>,
}

impl PendingCall {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the response or the deadline, whichever comes first.
    pub async fn wait(mut self) -> Result<Value, RpcError> {
        match tokio::time::timeout_at(self.deadline, &mut self.completion).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::ChannelClosed),
            Err(_) => {
                tracing::debug!(id = self.id, timeout = ?self.timeout, "call timed out");
                Err(RpcError::TimedOut(self.timeout))
            }
        }
    }

    pub fn cancel(self) {}
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.forget(self.id);
        }
    }
}

pub struct RpcEngine {
    shared: Arc<Shared>,
    receive_task: JoinHandle<()>,
}

impl RpcEngine {
    /// Start the receive loop over `channel`. Without a handler, inbound
    /// requests are answered with "method not found".
    pub fn start(channel: Arc<EncryptedChannel>, handler: Option<RequestHandler>) -> Self {
        let shared = Arc::new(Shared {
            channel,
            pending: StdMutex::new(PendingTable {
                next_id: 1,
                calls: HashMap::new(),
                closed: false,
            }),
        });
        let receive_task = tokio::spawn(receive_loop(shared.clone(), handler));
        Self {
            shared,
            receive_task,
        }
    }

    pub fn channel(&self) -> &Arc<EncryptedChannel> {
        &self.shared.channel
    }

    pub fn is_closed(&self) -> bool {
        self.shared.table().closed || self.shared.channel.is_closed()
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.table().calls.len()
    }

    /// Send a request and return a handle to await or cancel it.
    pub async fn begin(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<PendingCall, RpcError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut table = self.shared.table();
            if table.closed {
                return Err(RpcError::ChannelClosed);
            }
            let id = table.next_id;
            table.next_id += 1;
            table.calls.insert(id, tx);
            id
        };
        let call = PendingCall {
            id,
            deadline: deadline_after(timeout),
            timeout,
            completion: rx,
            shared: Arc::downgrade(&self.shared),
        };

        let payload = serde_json::to_vec(&RpcRequest::new(id, method, params))?;
        self.shared
            .channel
            .send(&payload)
            .await
            .map_err(|_| RpcError::ChannelClosed)?;
        tracing::trace!(id, method, "request sent");
        Ok(call)
    }

    /// Send a request and wait up to `timeout` for its response.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.begin(method, params, timeout).await?.wait().await
    }

    /// Fail all pending calls, close the channel and stop the receive loop.
    pub fn shutdown(&self) {
        self.shared.fail_all();
        self.shared.channel.close();
        self.receive_task.abort();
    }
}

impl Drop for RpcEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn receive_loop(shared: Arc<Shared>, handler: Option<RequestHandler>) {
    loop {
        let payload = match shared.channel.receive().await {
            Ok(payload) => payload,
            Err(ChannelError::Closed) => break,
            Err(e) => {
                tracing::warn!("rpc receive loop stopping: {e}");
                break;
            }
        };

        match serde_json::from_slice::<RpcMessage>(&payload) {
            Ok(RpcMessage::Response(response)) => shared.complete(response),
            Ok(RpcMessage::Request(request)) => {
                tokio::spawn(serve_request(shared.channel.clone(), handler.clone(), request));
            }
            Err(e) => {
                tracing::warn!("discarding undecodable rpc payload: {e}");
            }
        }
    }
    shared.fail_all();
}

async fn serve_request(
    channel: Arc<EncryptedChannel>,
    handler: Option<RequestHandler>,
    request: RpcRequest,
) {
    let id = request.id;
    let response = match handler {
        Some(handler) => {
            let method = request.method.clone();
            let result = tokio::select! {
                result = handler(request) => result,
                _ = channel.closed() => return,
            };
            if let Err(e) = &result {
                tracing::debug!(id, %method, code = e.code, "request failed");
            }
            match result {
                Ok(value) => RpcResponse::success(id, value),
                Err(error) => RpcResponse::failure(id, error),
            }
        }
        None => RpcResponse::failure(id, RpcErrorObject::method_not_found(&request.method)),
    };

    let payload = match serde_json::to_vec(&response) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(id, "failed to encode response: {e}");
            return;
        }
    };
    if let Err(e) = channel.send(&payload).await {
        tracing::debug!(id, "dropping response: {e}");
    }
}
