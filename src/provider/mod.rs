//! In-page EIP-1193 provider.
//!
//! [`EthereumProvider`] composes the request pipeline out of the pieces in
//! this module:
//!
//! | stage | component | effect |
//! |-------|-----------|--------|
//! | 1 | pre-ready buffer | holds calls made before [`EthereumProvider::mark_ready`] |
//! | 2 | [`DedupeLimiter`] | per-method in-flight accounting, single-flight rejection |
//! | 3 | [`ReadinessGate`] | waits for page visibility (flag 1) and tab check-in (flag 2) |
//! | 4 | [`CorrelatedChannel`] | id allocation, transport send, reply correlation |
//!
//! Unsolicited `message` frames skip all of that and go to the
//! [`PushEventRouter`].
//!
//! Every stage does its synchronous work when the request is made; the
//! returned future only waits for the reply.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use asupersync::Cx;
use asupersync::channel::oneshot;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::Instrument;

use crate::logging;

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod dedupe;
pub mod events;
pub mod gate;
pub mod legacy;
pub mod notice;
pub mod protocol;
pub mod push;

pub use channel::{CorrelatedChannel, PendingReply, ServeRequest, Transport, TransportError};
pub use config::{BridgeConfig, ConfigError, TransientStore};
pub use dedupe::{DedupeLimiter, InFlightGuard};
pub use events::{EventEmitter, Listener};
pub use gate::{GateTicket, ReadinessGate};
pub use protocol::{Frame, PageMetadata, ProviderStateSnapshot, RequestPayload, RpcError};
pub use push::{PushEvent, PushEventRouter};

/// Gate flag driven by page visibility.
pub const VISIBILITY_FLAG: usize = 1;
/// Gate flag set once the tab has checked in. Never cleared.
pub const CHECKIN_FLAG: usize = 2;

const PENDING_REQUEST_MESSAGE: &str = "there is a pending request, please request after it resolved";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("correlation id pool exhausted")]
    CapacityExceeded,
    #[error("a {method} request is already pending")]
    PendingRequestExists { method: String },
    #[error("invalid request payload")]
    InvalidRequest,
    #[error("{0}")]
    Rpc(RpcError),
    #[error("channel disposed before a response arrived")]
    Disposed,
    #[error("reply channel closed before a response arrived")]
    Disconnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("method {0} cannot be answered synchronously")]
    UnsupportedSyncMethod(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProviderError {
    /// The EIP-1193 / JSON-RPC error shape a caller sees for this failure.
    #[must_use]
    pub fn to_rpc(&self) -> RpcError {
        match self {
            Self::CapacityExceeded => RpcError::limit_exceeded(),
            Self::PendingRequestExists { .. } => {
                RpcError::transaction_rejected(PENDING_REQUEST_MESSAGE)
            }
            Self::InvalidRequest => RpcError::invalid_request(),
            Self::Rpc(err) => err.clone(),
            Self::Disposed => RpcError::user_rejected_request(),
            Self::Disconnected => RpcError::disconnected(),
            Self::Transport(err) => RpcError::from_payload(protocol::ErrorPayload {
                message: err.to_string(),
                stack: None,
                code: None,
                data: None,
            }),
            Self::UnsupportedSyncMethod(method) => {
                let mut err = RpcError::unsupported_method();
                err.data = Some(json!({ "method": method }));
                err
            }
            Self::Config(err) => RpcError::internal(err.to_string()),
        }
    }

    fn normalized(self) -> Self {
        match self {
            Self::Rpc(_) => self,
            other => Self::Rpc(other.to_rpc()),
        }
    }
}

impl From<RpcError> for ProviderError {
    fn from(err: RpcError) -> Self {
        Self::Rpc(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// The hosting document, as far as the provider needs to see it.
pub trait PageHost: Send + Sync {
    fn visibility(&self) -> Visibility;

    /// True once the document is past its loading phase.
    fn is_document_ready(&self) -> bool;

    fn page_metadata(&self) -> PageMetadata;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderState {
    pub chain_id: Option<String>,
    pub selected_address: Option<String>,
    pub accounts: Option<Vec<String>>,
    pub network_version: Option<String>,
    pub is_connected: bool,
    pub is_unlocked: bool,
    pub is_initialized: bool,
    pub is_ready: bool,
}

struct BufferedCall {
    payload: Value,
    reply: oneshot::Sender<Result<Dispatched, ProviderError>>,
}

struct ProviderInner {
    channel: CorrelatedChannel,
    gate: ReadinessGate,
    limiter: DedupeLimiter,
    emitter: Arc<EventEmitter>,
    router: PushEventRouter,
    state: Arc<StdMutex<ProviderState>>,
    buffered: StdMutex<VecDeque<BufferedCall>>,
    host: Arc<dyn PageHost>,
    checked_in: AtomicBool,
}

#[derive(Clone)]
pub struct EthereumProvider {
    inner: Arc<ProviderInner>,
}

impl std::fmt::Debug for EthereumProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EthereumProvider")
            .field("channel", &self.inner.channel)
            .field("gate", &self.inner.gate)
            .field("state", &self.state())
            .field("buffered", &self.buffered_count())
            .finish_non_exhaustive()
    }
}

impl EthereumProvider {
    /// Builds the pipeline and performs the construction-time wiring: push
    /// routing, the initial visibility flag and, if the document is already
    /// loaded, the tab check-in.
    ///
    /// The provider-state handshake is started separately with
    /// [`EthereumProvider::initialize`].
    pub fn new(
        config: &BridgeConfig,
        transport: Arc<dyn Transport>,
        host: Arc<dyn PageHost>,
    ) -> Result<Self, ProviderError> {
        config.validate()?;
        let _span = logging::channel_span(&config.channel_name).entered();

        let channel = CorrelatedChannel::with_pool_size(
            config.channel_name.clone(),
            transport,
            config.id_pool_size,
        )?;
        let emitter = Arc::new(EventEmitter::new(config.max_listeners));
        let state = Arc::new(StdMutex::new(ProviderState::default()));
        let router = PushEventRouter::new(Arc::clone(&state), Arc::clone(&emitter));

        let push_router = router.clone();
        channel.on_message(move |body| push_router.dispatch_message(body));

        let provider = Self {
            inner: Arc::new(ProviderInner {
                channel,
                gate: ReadinessGate::new(2),
                limiter: DedupeLimiter::new(config.single_flight_methods.iter().cloned()),
                emitter,
                router,
                state,
                buffered: StdMutex::new(VecDeque::new()),
                host,
                checked_in: AtomicBool::new(false),
            }),
        };

        provider.notify_visibility_change();
        if provider.inner.host.is_document_ready() {
            provider.notify_document_ready();
        }
        tracing::debug!(
            pool = config.id_pool_size,
            single_flight = config.single_flight_methods.len(),
            "provider constructed"
        );
        Ok(provider)
    }

    // ========================================================================
    // Host signals
    // ========================================================================

    /// Re-reads page visibility into the gate's visibility flag.
    pub fn notify_visibility_change(&self) {
        let visible = self.inner.host.visibility() == Visibility::Visible;
        self.inner.gate.set(VISIBILITY_FLAG, visible);
    }

    /// Sends the one-time `tabCheckin` notification and sets the check-in
    /// flag. Later calls do nothing.
    pub fn notify_document_ready(&self) {
        if self.inner.checked_in.swap(true, Ordering::SeqCst) {
            return;
        }
        let metadata = self.inner.host.page_metadata();
        let payload = json!({
            "method": "tabCheckin",
            "params": metadata,
        });
        // The reply carries nothing; drop the handle and keep going.
        match self.inner.channel.send(payload) {
            Ok(reply) => tracing::debug!(ident = reply.ident(), origin = %metadata.origin, "tab check-in sent"),
            Err(err) => tracing::warn!("tab check-in failed: {err}"),
        }
        self.inner.gate.check(CHECKIN_FLAG);
    }

    /// Routes one inbound transport frame. The page side never serves
    /// requests, so inbound request frames are dropped.
    pub fn handle_frame(&self, frame: Frame) {
        if let Some(serve) = self.inner.channel.handle_frame(frame) {
            tracing::debug!(ident = serve.ident(), "ignoring inbound request frame");
        }
    }

    // ========================================================================
    // Handshake and readiness
    // ========================================================================

    /// Runs the `getProviderState` handshake. The request is issued before
    /// this returns; the future completes once the reply (or failure) has
    /// been applied. Always ends with `is_initialized = true` and an
    /// `_initialized` emission.
    pub fn initialize(&self) -> impl Future<Output = ()> + use<> {
        let handshake = self.request_internal(json!({ "method": "getProviderState" }));
        let provider = self.clone();
        async move {
            let snapshot = handshake.await.and_then(|value| {
                serde_json::from_value::<ProviderStateSnapshot>(value).map_err(|err| {
                    ProviderError::Rpc(RpcError::internal(format!(
                        "malformed provider state: {err}"
                    )))
                })
            });
            match snapshot {
                Ok(snapshot) => provider.apply_snapshot(snapshot),
                Err(err) => tracing::debug!("provider state handshake failed: {err}"),
            }
            provider.lock_state().is_initialized = true;
            provider.inner.emitter.emit("_initialized", &Value::Null);
        }
    }

    fn apply_snapshot(&self, snapshot: ProviderStateSnapshot) {
        {
            let mut state = self.lock_state();
            if snapshot.is_unlocked {
                state.is_unlocked = true;
            }
            state.chain_id.clone_from(&snapshot.chain_id);
            state.network_version.clone_from(&snapshot.network_version);
        }
        self.inner
            .emitter
            .emit("connect", &json!({ "chainId": snapshot.chain_id }));
        self.inner.router.handle(PushEvent::ChainChanged {
            chain: snapshot.chain_id,
            network_version: snapshot.network_version,
        });
        self.inner
            .router
            .handle(PushEvent::AccountsChanged(snapshot.accounts));
    }

    /// Declares the provider ready: attaches listeners registered so far and
    /// dispatches buffered calls in arrival order.
    pub fn mark_ready(&self) {
        let buffered = {
            let mut buffer = self.inner.buffered.lock().expect("buffer mutex poisoned");
            {
                let mut state = self.lock_state();
                if state.is_ready {
                    return;
                }
                state.is_ready = true;
            }
            std::mem::take(&mut *buffer)
        };

        let attached = self.inner.emitter.attach_deferred();
        tracing::debug!(attached, buffered = buffered.len(), "provider ready");

        let cx = Cx::for_request();
        for call in buffered {
            let outcome = self.start_dispatch(call.payload);
            let _ = call.reply.send(&cx, outcome);
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// EIP-1193 `request`. Calls made before readiness are buffered and
    /// dispatched by [`EthereumProvider::mark_ready`]. Every failure reaches
    /// the caller as [`ProviderError::Rpc`].
    pub fn request(&self, payload: Value) -> impl Future<Output = Result<Value, ProviderError>> + use<> {
        let admission = match method_of(&payload) {
            Err(err) => Admission::Rejected(err),
            Ok(_) => self.admit(payload),
        };
        async move {
            match admission {
                Admission::Rejected(err) => Err(err.normalized()),
                Admission::Dispatched(dispatched) => dispatched.finish().await,
                Admission::Buffered(mut rx) => {
                    let cx = Cx::for_request();
                    let dispatched = rx
                        .recv(&cx)
                        .await
                        .map_err(|_| ProviderError::Disconnected.normalized())?
                        .map_err(ProviderError::normalized)?;
                    dispatched.finish().await
                }
            }
        }
    }

    /// Typed convenience over [`EthereumProvider::request`].
    pub fn request_payload(
        &self,
        payload: &RequestPayload,
    ) -> impl Future<Output = Result<Value, ProviderError>> + use<> {
        let value = serde_json::to_value(payload).unwrap_or(Value::Null);
        self.request(value)
    }

    /// Privileged path for handshake and metadata calls: skips the pre-ready
    /// buffer, still goes through the limiter and the gate.
    pub fn request_internal(
        &self,
        payload: Value,
    ) -> impl Future<Output = Result<Value, ProviderError>> + use<> {
        let dispatched = self.start_dispatch(payload);
        async move { dispatched.map_err(ProviderError::normalized)?.finish().await }
    }

    fn admit(&self, payload: Value) -> Admission {
        {
            let mut buffer = self.inner.buffered.lock().expect("buffer mutex poisoned");
            if !self.lock_state().is_ready {
                let (tx, rx) = oneshot::channel();
                buffer.push_back(BufferedCall { payload, reply: tx });
                tracing::debug!(buffered = buffer.len(), "buffering request until ready");
                return Admission::Buffered(rx);
            }
        }
        match self.start_dispatch(payload) {
            Ok(dispatched) => Admission::Dispatched(dispatched),
            Err(err) => Admission::Rejected(err),
        }
    }

    fn start_dispatch(&self, payload: Value) -> Result<Dispatched, ProviderError> {
        let method = method_of(&payload)?;
        let guard = self.inner.limiter.acquire(&method)?;

        self.notify_visibility_change();

        if method != "eth_call" {
            tracing::debug!(method = %method, "request");
        }
        let channel = self.inner.channel.clone();
        let ticket = self.inner.gate.call(move || channel.send(payload));
        Ok(Dispatched {
            method,
            guard,
            ticket,
        })
    }

    // ========================================================================
    // Listeners and state
    // ========================================================================

    /// Registers a listener. Before readiness the listener is held back and
    /// attached by [`EthereumProvider::mark_ready`].
    pub fn on<F>(&self, event: &str, listener: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        if self.is_ready() {
            self.inner.emitter.on(event, listener);
        } else {
            self.inner.emitter.defer(event, listener);
        }
        self
    }

    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.emitter.listener_count(event)
    }

    /// Rejects every in-flight request and closes the transport.
    pub fn dispose(&self) {
        self.inner.channel.dispose();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.inner
            .state
            .lock()
            .expect("provider state mutex poisoned")
    }

    #[must_use]
    pub fn state(&self) -> ProviderState {
        self.lock_state().clone()
    }

    #[must_use]
    pub fn chain_id(&self) -> Option<String> {
        self.lock_state().chain_id.clone()
    }

    #[must_use]
    pub fn selected_address(&self) -> Option<String> {
        self.lock_state().selected_address.clone()
    }

    #[must_use]
    pub fn network_version(&self) -> Option<String> {
        self.lock_state().network_version.clone()
    }

    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.lock_state().is_unlocked
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.lock_state().is_initialized
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.lock_state().is_ready
    }

    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.inner
            .buffered
            .lock()
            .expect("buffer mutex poisoned")
            .len()
    }

    #[must_use]
    pub fn channel(&self) -> &CorrelatedChannel {
        &self.inner.channel
    }

    #[must_use]
    pub fn gate(&self) -> &ReadinessGate {
        &self.inner.gate
    }
}

fn method_of(payload: &Value) -> Result<String, ProviderError> {
    payload
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProviderError::InvalidRequest)
}

enum Admission {
    Rejected(ProviderError),
    Dispatched(Dispatched),
    Buffered(oneshot::Receiver<Result<Dispatched, ProviderError>>),
}

/// A request that has passed the limiter and been handed to the gate.
struct Dispatched {
    method: String,
    guard: InFlightGuard,
    ticket: GateTicket<Result<PendingReply, ProviderError>>,
}

impl Dispatched {
    async fn finish(self) -> Result<Value, ProviderError> {
        let Self {
            method,
            guard,
            ticket,
        } = self;
        let quiet = method == "eth_call";

        let reply = ticket
            .wait()
            .await
            .and_then(|sent| sent)
            .map_err(ProviderError::normalized)?;
        let span = logging::request_span(&method, Some(reply.ident()));
        let outcome = async {
            let outcome = reply.recv().await.map_err(ProviderError::normalized);
            if !quiet {
                match &outcome {
                    Ok(_) => tracing::debug!("request succeeded"),
                    Err(err) => tracing::debug!("request failed: {err}"),
                }
            }
            outcome
        }
        .instrument(span)
        .await;

        drop(guard);
        outcome
    }
}
