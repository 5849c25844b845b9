//! Duplex request/response channel with bounded-pool correlation ids.
//!
//! Every outbound request borrows an id from a fixed pool and holds it until
//! the matching response arrives (or the channel is disposed). At most
//! `pool_size` requests are in flight per channel; the pool and the waiting
//! set always partition `0..pool_size`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use asupersync::Cx;
use asupersync::channel::oneshot;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use super::ProviderError;
use super::config::ConfigError;
use super::protocol::{
    CorrelationId, ErrorPayload, Frame, RequestFrame, ResponseFrame, RpcError,
};

pub const DEFAULT_ID_POOL_SIZE: usize = 1000;

type Reply = Result<Value, ProviderError>;
type RequestHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ErrorPayload>> + Send + Sync>;
type MessageListener = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Error)]
#[error("transport failure: {0}")]
pub struct TransportError(pub String);

/// Ordered duplex link to the peer, scoped by channel name.
///
/// Inbound frames are not pulled through this trait; whoever owns the
/// transport feeds them to [`CorrelatedChannel::handle_frame`].
pub trait Transport: Send + Sync {
    fn post(&self, frame: &Frame) -> Result<(), TransportError>;

    fn close(&self) {}
}

struct PendingRequest {
    payload: Value,
    reply: oneshot::Sender<Reply>,
}

struct ChannelState {
    id_pool: VecDeque<CorrelationId>,
    waiting: HashMap<CorrelationId, PendingRequest>,
    disposed: bool,
}

struct ChannelInner {
    name: String,
    transport: Arc<dyn Transport>,
    state: StdMutex<ChannelState>,
    request_handler: StdMutex<Option<RequestHandler>>,
    message_listener: StdMutex<Option<MessageListener>>,
}

#[derive(Clone)]
pub struct CorrelatedChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for CorrelatedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("channel state mutex poisoned");
        f.debug_struct("CorrelatedChannel")
            .field("name", &self.inner.name)
            .field("pending", &state.waiting.len())
            .field("available_ids", &state.id_pool.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl CorrelatedChannel {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ProviderError> {
        Self::with_pool_size(name, transport, DEFAULT_ID_POOL_SIZE)
    }

    pub fn with_pool_size(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        pool_size: usize,
    ) -> Result<Self, ProviderError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::MissingChannelName.into());
        }
        let size = CorrelationId::try_from(pool_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(ConfigError::InvalidValue {
                field: "idPoolSize",
                reason: "must be between 1 and u32::MAX",
            })?;

        Ok(Self {
            inner: Arc::new(ChannelInner {
                name,
                transport,
                state: StdMutex::new(ChannelState {
                    id_pool: (0..size).collect(),
                    waiting: HashMap::new(),
                    disposed: false,
                }),
                request_handler: StdMutex::new(None),
                message_listener: StdMutex::new(None),
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Allocates an id, records the pending entry and posts the request
    /// frame before returning. Fails without touching the transport when
    /// the pool is exhausted.
    pub fn send(&self, payload: Value) -> Result<PendingReply, ProviderError> {
        let (tx, rx) = oneshot::channel();
        let ident = {
            let mut state = self.inner.state.lock().expect("channel state mutex poisoned");
            if state.disposed {
                return Err(ProviderError::Disposed);
            }
            let Some(ident) = state.id_pool.pop_front() else {
                tracing::warn!(channel = %self.inner.name, "correlation id pool exhausted");
                return Err(ProviderError::CapacityExceeded);
            };
            state.waiting.insert(
                ident,
                PendingRequest {
                    payload: payload.clone(),
                    reply: tx,
                },
            );
            ident
        };

        let frame = Frame::Request(RequestFrame {
            ident,
            data: payload,
        });
        if let Err(err) = self.inner.transport.post(&frame) {
            let mut state = self.inner.state.lock().expect("channel state mutex poisoned");
            if state.waiting.remove(&ident).is_some() {
                state.id_pool.push_back(ident);
            }
            return Err(err.into());
        }

        Ok(PendingReply { ident, rx })
    }

    /// Registers the processor for inbound request frames.
    pub fn on_request<F, Fut>(&self, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorPayload>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |data| handler(data).boxed());
        *self
            .inner
            .request_handler
            .lock()
            .expect("request handler mutex poisoned") = Some(handler);
    }

    /// Registers the receiver for out-of-band `message` frames.
    pub fn on_message<F>(&self, listener: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        *self
            .inner
            .message_listener
            .lock()
            .expect("message listener mutex poisoned") = Some(Arc::new(listener));
    }

    /// Routes one inbound frame. Responses and messages are handled before
    /// this returns; a request frame comes back as a [`ServeRequest`] that
    /// the caller drives to completion.
    #[must_use]
    pub fn handle_frame(&self, frame: Frame) -> Option<ServeRequest> {
        match frame {
            Frame::Response(response) => {
                self.resolve(response);
                None
            }
            Frame::Request(request) => Some(ServeRequest {
                channel: self.clone(),
                request,
            }),
            Frame::Message(body) => {
                let listener = self
                    .inner
                    .message_listener
                    .lock()
                    .expect("message listener mutex poisoned")
                    .clone();
                match listener {
                    Some(listener) => listener(body),
                    None => tracing::debug!(channel = %self.inner.name, "no message listener; dropping push frame"),
                }
                None
            }
        }
    }

    fn resolve(&self, response: ResponseFrame) {
        let pending = {
            let mut state = self.inner.state.lock().expect("channel state mutex poisoned");
            let Some(pending) = state.waiting.remove(&response.ident) else {
                tracing::debug!(
                    channel = %self.inner.name,
                    ident = response.ident,
                    "dropping response for unknown ident"
                );
                return;
            };
            state.id_pool.push_back(response.ident);
            pending
        };

        let outcome = match response.err {
            Some(err) => Err(ProviderError::Rpc(RpcError::from_payload(err))),
            None => Ok(response.res.unwrap_or(Value::Null)),
        };
        let cx = Cx::for_request();
        let _ = pending.reply.send(&cx, outcome);
    }

    /// Rejects every pending request with [`ProviderError::Disposed`] and
    /// closes the transport. Terminal for this instance.
    pub fn dispose(&self) {
        let drained: Vec<(CorrelationId, PendingRequest)> = {
            let mut state = self.inner.state.lock().expect("channel state mutex poisoned");
            state.disposed = true;
            state.waiting.drain().collect()
        };

        let cx = Cx::for_request();
        for (ident, pending) in drained {
            let method = pending
                .payload
                .get("method")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            tracing::debug!(
                channel = %self.inner.name,
                ident,
                method,
                "rejecting pending request on dispose"
            );
            let _ = pending.reply.send(&cx, Err(ProviderError::Disposed));
        }
        self.inner.transport.close();
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("channel state mutex poisoned")
            .waiting
            .len()
    }

    #[must_use]
    pub fn available_ids(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("channel state mutex poisoned")
            .id_pool
            .len()
    }

    #[must_use]
    pub fn pending_idents(&self) -> Vec<CorrelationId> {
        let state = self.inner.state.lock().expect("channel state mutex poisoned");
        let mut idents: Vec<_> = state.waiting.keys().copied().collect();
        idents.sort_unstable();
        idents
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("channel state mutex poisoned")
            .disposed
    }

    fn post_response(&self, response: ResponseFrame) {
        let ident = response.ident;
        if let Err(err) = self.inner.transport.post(&Frame::Response(response)) {
            tracing::warn!(channel = %self.inner.name, ident, "failed to post response: {err}");
        }
    }
}

/// Handle to the eventual reply for one sent request.
#[must_use = "dropping a PendingReply discards the response"]
pub struct PendingReply {
    ident: CorrelationId,
    rx: oneshot::Receiver<Reply>,
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("ident", &self.ident)
            .finish_non_exhaustive()
    }
}

impl PendingReply {
    #[must_use]
    pub fn ident(&self) -> CorrelationId {
        self.ident
    }

    pub async fn recv(mut self) -> Result<Value, ProviderError> {
        let cx = Cx::for_request();
        match self.rx.recv(&cx).await {
            Ok(reply) => reply,
            Err(_) => Err(ProviderError::Disconnected),
        }
    }
}

/// An inbound request waiting to be run through the registered handler.
#[must_use = "the request is only answered once `run` completes"]
pub struct ServeRequest {
    channel: CorrelatedChannel,
    request: RequestFrame,
}

impl ServeRequest {
    #[must_use]
    pub fn ident(&self) -> CorrelationId {
        self.request.ident
    }

    /// Runs the handler and posts `{ident, res}` or `{ident, err}` back.
    pub async fn run(self) {
        let handler = self
            .channel
            .inner
            .request_handler
            .lock()
            .expect("request handler mutex poisoned")
            .clone();
        let Some(handler) = handler else {
            tracing::debug!(
                channel = %self.channel.inner.name,
                ident = self.request.ident,
                "no request handler registered; dropping request"
            );
            return;
        };

        let ident = self.request.ident;
        let response = match handler(self.request.data).await {
            Ok(res) => ResponseFrame {
                ident,
                res: Some(res),
                err: None,
            },
            Err(err) => ResponseFrame {
                ident,
                res: None,
                err: Some(err),
            },
        };
        self.channel.post_response(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::protocol::USER_REJECTED_REQUEST;
    use asupersync::runtime::RuntimeBuilder;
    use proptest::prelude::*;
    use serde_json::json;

    fn run_async<T>(future: impl std::future::Future<Output = T>) -> T {
        let runtime = RuntimeBuilder::current_thread()
            .build()
            .expect("runtime build");
        runtime.block_on(future)
    }

    #[derive(Default)]
    struct RecordingTransport {
        frames: StdMutex<Vec<Frame>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingTransport {
        fn frames(&self) -> Vec<Frame> {
            self.frames.lock().expect("frames mutex poisoned").clone()
        }
    }

    impl Transport for RecordingTransport {
        fn post(&self, frame: &Frame) -> Result<(), TransportError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(TransportError("channel closed".to_string()));
            }
            self.frames
                .lock()
                .expect("frames mutex poisoned")
                .push(frame.clone());
            Ok(())
        }
    }

    fn channel_with(pool_size: usize) -> (CorrelatedChannel, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let channel = CorrelatedChannel::with_pool_size("test-channel", transport.clone(), pool_size)
            .expect("channel");
        (channel, transport)
    }

    fn respond(channel: &CorrelatedChannel, ident: CorrelationId, res: Value) {
        let serve = channel.handle_frame(Frame::Response(ResponseFrame {
            ident,
            res: Some(res),
            err: None,
        }));
        assert!(serve.is_none());
    }

    #[test]
    fn empty_channel_name_is_rejected() {
        let err = CorrelatedChannel::new("", Arc::new(RecordingTransport::default()))
            .expect_err("empty name must fail");
        assert!(matches!(
            err,
            ProviderError::Config(ConfigError::MissingChannelName)
        ));
    }

    #[test]
    fn send_posts_tagged_request_frame() {
        let (channel, transport) = channel_with(4);

        let reply = channel.send(json!({"method": "eth_chainId"})).expect("send");

        assert_eq!(reply.ident(), 0);
        assert_eq!(
            transport.frames(),
            vec![Frame::Request(RequestFrame {
                ident: 0,
                data: json!({"method": "eth_chainId"}),
            })]
        );
        assert_eq!(channel.pending_count(), 1);
        assert_eq!(channel.available_ids(), 3);
    }

    #[test]
    fn responses_in_reverse_order_reach_their_own_callers() {
        let (channel, _transport) = channel_with(16);
        let replies: Vec<_> = (0..16)
            .map(|n| channel.send(json!({"method": "echo", "params": [n]})).expect("send"))
            .collect();

        for reply in replies.iter().rev() {
            respond(&channel, reply.ident(), json!({"echo": reply.ident()}));
        }

        run_async(async {
            for reply in replies {
                let ident = reply.ident();
                let value = reply.recv().await.expect("reply");
                assert_eq!(value["echo"], json!(ident), "reply routed by ident");
            }
        });
        assert_eq!(channel.pending_count(), 0);
        assert_eq!(channel.available_ids(), 16);
    }

    #[test]
    fn exhausted_pool_fails_without_touching_transport() {
        let (channel, transport) = channel_with(3);
        let _replies: Vec<_> = (0..3)
            .map(|_| channel.send(json!({"method": "eth_blockNumber"})).expect("send"))
            .collect();

        let err = channel
            .send(json!({"method": "eth_blockNumber"}))
            .expect_err("fourth send must fail");

        assert!(matches!(err, ProviderError::CapacityExceeded));
        assert_eq!(transport.frames().len(), 3, "no frame for the rejected send");
    }

    #[test]
    fn recycled_id_is_reused_after_response() {
        let (channel, _transport) = channel_with(1);
        let first = channel.send(json!({"method": "a"})).expect("send");
        respond(&channel, first.ident(), json!(1));

        let second = channel.send(json!({"method": "b"})).expect("pool refilled");
        assert_eq!(second.ident(), first.ident());
    }

    #[test]
    fn unknown_ident_response_is_dropped() {
        let (channel, _transport) = channel_with(4);
        let reply = channel.send(json!({"method": "a"})).expect("send");

        respond(&channel, 99, json!("stale"));

        assert_eq!(channel.pending_count(), 1);
        assert_eq!(channel.pending_idents(), vec![reply.ident()]);
        assert_eq!(channel.available_ids(), 3);
    }

    #[test]
    fn error_response_is_normalized() {
        let (channel, _transport) = channel_with(4);
        let reply = channel.send(json!({"method": "eth_sendTransaction"})).expect("send");

        let _ = channel.handle_frame(Frame::Response(ResponseFrame {
            ident: reply.ident(),
            res: None,
            err: Some(ErrorPayload {
                message: "User rejected".to_string(),
                stack: None,
                code: Some(USER_REJECTED_REQUEST),
                data: None,
            }),
        }));

        let err = run_async(reply.recv()).expect_err("must reject");
        match err {
            ProviderError::Rpc(rpc) => {
                assert_eq!(rpc.code, USER_REJECTED_REQUEST);
                assert_eq!(rpc.message, "User rejected");
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[test]
    fn dispose_rejects_every_pending_request() {
        let (channel, _transport) = channel_with(8);
        let replies: Vec<_> = (0..5)
            .map(|_| channel.send(json!({"method": "eth_accounts"})).expect("send"))
            .collect();

        channel.dispose();

        assert_eq!(channel.pending_count(), 0);
        run_async(async {
            for reply in replies {
                let err = reply.recv().await.expect_err("disposed");
                assert!(matches!(err, ProviderError::Disposed));
                assert_eq!(err.to_rpc().code, USER_REJECTED_REQUEST);
            }
        });
        assert!(matches!(
            channel.send(json!({"method": "x"})),
            Err(ProviderError::Disposed)
        ));
    }

    #[test]
    fn transport_failure_returns_id_to_pool() {
        let (channel, transport) = channel_with(2);
        transport
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = channel.send(json!({"method": "a"})).expect_err("post fails");

        assert!(matches!(err, ProviderError::Transport(_)));
        assert_eq!(channel.pending_count(), 0);
        assert_eq!(channel.available_ids(), 2);
    }

    #[test]
    fn inbound_request_is_answered_with_result() {
        let (channel, transport) = channel_with(2);
        channel.on_request(|data: Value| async move { Ok(json!({ "seen": data["method"] })) });

        let serve = channel
            .handle_frame(Frame::Request(RequestFrame {
                ident: 41,
                data: json!({"method": "getProviderState"}),
            }))
            .expect("request frames are served");
        run_async(serve.run());

        assert_eq!(
            transport.frames(),
            vec![Frame::Response(ResponseFrame {
                ident: 41,
                res: Some(json!({"seen": "getProviderState"})),
                err: None,
            })]
        );
    }

    #[test]
    fn inbound_request_failure_keeps_code_and_data() {
        let (channel, transport) = channel_with(2);
        channel.on_request(|_data: Value| async move {
            Err(ErrorPayload {
                message: "locked".to_string(),
                stack: Some("Error: locked\n    at bg".to_string()),
                code: Some(4100),
                data: Some(json!({"reason": "locked"})),
            })
        });

        let serve = channel
            .handle_frame(Frame::Request(RequestFrame {
                ident: 2,
                data: json!({"method": "eth_sign"}),
            }))
            .expect("served");
        run_async(serve.run());

        let frames = transport.frames();
        let Frame::Response(response) = &frames[0] else {
            panic!("expected response frame, got {frames:?}");
        };
        let err = response.err.as_ref().expect("error payload");
        assert_eq!(err.code, Some(4100));
        assert_eq!(err.data, Some(json!({"reason": "locked"})));
        assert!(err.stack.as_deref().is_some_and(|s| s.contains("at bg")));
    }

    #[test]
    fn message_frames_reach_listener() {
        let (channel, _transport) = channel_with(2);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.on_message(move |body| sink.lock().expect("seen mutex").push(body));

        let _ = channel.handle_frame(Frame::Message(json!({"event": "connect", "data": {}})));

        assert_eq!(seen.lock().expect("seen mutex").len(), 1);
    }

    proptest! {
        #[test]
        fn id_pool_and_waiting_set_partition_the_id_space(
            ops in prop::collection::vec((any::<bool>(), 0_usize..64), 1..120)
        ) {
            let (channel, _transport) = channel_with(8);
            let mut replies = Vec::new();

            for (is_send, pick) in ops {
                if is_send {
                    match channel.send(json!({"method": "x"})) {
                        Ok(reply) => replies.push(reply),
                        Err(err) => prop_assert!(matches!(err, ProviderError::CapacityExceeded)),
                    }
                } else if !replies.is_empty() {
                    let reply = replies.swap_remove(pick % replies.len());
                    respond(&channel, reply.ident(), json!(null));
                }

                let pending = channel.pending_idents();
                prop_assert_eq!(pending.len() + channel.available_ids(), 8);
                prop_assert_eq!(pending.len(), replies.len());
            }
        }
    }
}
