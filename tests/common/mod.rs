//! Shared fixtures for provider integration tests.
//!
//! [`Wire`] links a page-side [`EthereumProvider`] to a [`MockExtension`]
//! that owns its own [`CorrelatedChannel`]. Frames are queued per direction
//! and only move when a test calls [`Wire::pump`], so every test decides
//! exactly when the extension sees a request and when the page sees a reply.
//! Each hop goes through the newline-delimited wire codec.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use asupersync::runtime::RuntimeBuilder;
use serde_json::{Value, json};
use unhosted::provider::bootstrap::{ProviderInfo, WalletHost};
use unhosted::provider::notice::{Notice, NoticeHandle, NoticeRenderer};
use unhosted::provider::protocol::{ErrorPayload, decode_frame, encode_frame};
use unhosted::provider::{
    BridgeConfig, CorrelatedChannel, EthereumProvider, Frame, PageHost, PageMetadata, Transport,
    TransportError, Visibility,
};

pub fn run_async<T>(future: impl std::future::Future<Output = T>) -> T {
    let runtime = RuntimeBuilder::current_thread()
        .build()
        .expect("runtime build");
    runtime.block_on(future)
}

// ═══════════════════════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════════════════════

/// One direction of the wire. Frames are stored encoded.
#[derive(Default)]
pub struct Mailbox {
    bytes: StdMutex<VecDeque<Vec<u8>>>,
    closed: AtomicBool,
}

impl Mailbox {
    pub fn take_all(&self) -> Vec<Frame> {
        let drained: Vec<Vec<u8>> = self
            .bytes
            .lock()
            .expect("mailbox mutex poisoned")
            .drain(..)
            .collect();
        drained
            .iter()
            .map(|bytes| {
                let (frame, used) = decode_frame::<Frame>(bytes)
                    .expect("decode frame")
                    .expect("complete frame");
                assert_eq!(used, bytes.len());
                frame
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().expect("mailbox mutex poisoned").len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for Mailbox {
    fn post(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError("mailbox closed".to_string()));
        }
        let encoded = encode_frame(frame).map_err(|err| TransportError(err.to_string()))?;
        self.bytes
            .lock()
            .expect("mailbox mutex poisoned")
            .push_back(encoded);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Extension side
// ═══════════════════════════════════════════════════════════════════════════

type Answers = Arc<StdMutex<HashMap<String, Result<Value, ErrorPayload>>>>;

/// Extension background stand-in. Answers requests from a method table and
/// records every request body it receives.
pub struct MockExtension {
    pub channel: CorrelatedChannel,
    pub outbox: Arc<Mailbox>,
    answers: Answers,
    received: Arc<StdMutex<Vec<Value>>>,
}

impl MockExtension {
    pub fn new(name: &str) -> Self {
        let outbox = Arc::new(Mailbox::default());
        let channel = CorrelatedChannel::new(name, outbox.clone()).expect("extension channel");
        let answers: Answers = Arc::new(StdMutex::new(HashMap::new()));
        let received = Arc::new(StdMutex::new(Vec::new()));

        let table = Arc::clone(&answers);
        let log = Arc::clone(&received);
        channel.on_request(move |data: Value| {
            log.lock().expect("received mutex poisoned").push(data.clone());
            let method = data["method"].as_str().unwrap_or_default().to_string();
            let answer = table
                .lock()
                .expect("answers mutex poisoned")
                .get(&method)
                .cloned()
                .unwrap_or(Ok(Value::Null));
            async move { answer }
        });

        Self {
            channel,
            outbox,
            answers,
            received,
        }
    }

    pub fn answer(&self, method: &str, result: Value) -> &Self {
        self.answers
            .lock()
            .expect("answers mutex poisoned")
            .insert(method.to_string(), Ok(result));
        self
    }

    pub fn fail(&self, method: &str, code: Option<i64>, message: &str) -> &Self {
        self.answers.lock().expect("answers mutex poisoned").insert(
            method.to_string(),
            Err(ErrorPayload {
                message: message.to_string(),
                stack: None,
                code,
                data: None,
            }),
        );
        self
    }

    /// Queues an unsolicited push for the page.
    pub fn push(&self, event: &str, data: Value) {
        self.outbox
            .post(&Frame::Message(json!({ "event": event, "data": data })))
            .expect("push frame");
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().expect("received mutex poisoned").clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|data| data["method"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Page side
// ═══════════════════════════════════════════════════════════════════════════

pub struct MockPage {
    visible: AtomicBool,
    loaded: AtomicBool,
}

impl MockPage {
    pub fn new(visible: bool, loaded: bool) -> Arc<Self> {
        Arc::new(Self {
            visible: AtomicBool::new(visible),
            loaded: AtomicBool::new(loaded),
        })
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::SeqCst);
    }
}

impl PageHost for MockPage {
    fn visibility(&self) -> Visibility {
        if self.visible.load(Ordering::SeqCst) {
            Visibility::Visible
        } else {
            Visibility::Hidden
        }
    }

    fn is_document_ready(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn page_metadata(&self) -> PageMetadata {
        PageMetadata {
            icon: Some("https://dapp.test/favicon.ico".to_string()),
            name: "Test Dapp".to_string(),
            origin: "https://dapp.test".to_string(),
        }
    }
}

#[derive(Default)]
pub struct MockWallet {
    pub injected: AtomicBool,
    pub default_calls: StdMutex<Vec<bool>>,
    pub announced: StdMutex<Vec<ProviderInfo>>,
}

impl WalletHost for MockWallet {
    fn has_injected_provider(&self) -> bool {
        self.injected.load(Ordering::SeqCst)
    }

    fn set_default_provider(&self, unhosted_as_default: bool) {
        self.default_calls
            .lock()
            .expect("wallet mutex poisoned")
            .push(unhosted_as_default);
    }

    fn announce_provider(&self, info: &ProviderInfo) {
        self.announced
            .lock()
            .expect("wallet mutex poisoned")
            .push(info.clone());
    }
}

/// Records what was shown and hidden, in order.
#[derive(Default)]
pub struct MockNotices {
    pub log: Arc<StdMutex<Vec<String>>>,
    pub framed: AtomicBool,
}

struct LoggedNotice {
    label: String,
    log: Arc<StdMutex<Vec<String>>>,
}

impl NoticeHandle for LoggedNotice {
    fn hide(&mut self) {
        self.log
            .lock()
            .expect("notice log mutex poisoned")
            .push(format!("hide {}", self.label));
    }
}

impl NoticeRenderer for MockNotices {
    fn show(&self, notice: &Notice) -> Box<dyn NoticeHandle> {
        let label = match notice {
            Notice::ChainSwitch(switch) => format!("chain:{}", switch.chain_name),
            Notice::DefaultWallet(kind) => format!("wallet:{}", kind.title()),
        };
        self.log
            .lock()
            .expect("notice log mutex poisoned")
            .push(format!("show {label}"));
        Box::new(LoggedNotice {
            label,
            log: Arc::clone(&self.log),
        })
    }

    fn in_same_origin_iframe(&self) -> bool {
        self.framed.load(Ordering::SeqCst)
    }
}

impl MockNotices {
    pub fn entries(&self) -> Vec<String> {
        self.log.lock().expect("notice log mutex poisoned").clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Wire
// ═══════════════════════════════════════════════════════════════════════════

pub struct Wire {
    pub page_outbox: Arc<Mailbox>,
    pub extension: MockExtension,
}

impl Wire {
    pub fn new(name: &str) -> Self {
        Self {
            page_outbox: Arc::new(Mailbox::default()),
            extension: MockExtension::new(name),
        }
    }

    /// Moves frames both ways until the wire is quiet: the extension serves
    /// every queued request, then the page receives every reply and push.
    pub async fn pump(&self, provider: &EthereumProvider) {
        loop {
            let to_extension = self.page_outbox.take_all();
            let to_page = self.extension.outbox.take_all();
            if to_extension.is_empty() && to_page.is_empty() {
                return;
            }
            for frame in to_extension {
                if let Some(serve) = self.extension.channel.handle_frame(frame) {
                    serve.run().await;
                }
            }
            for frame in to_page {
                provider.handle_frame(frame);
            }
        }
    }
}

pub struct Page {
    pub provider: EthereumProvider,
    pub wire: Wire,
    pub host: Arc<MockPage>,
}

/// A constructed provider on a loaded, visible page. Not yet ready.
pub fn page(config: BridgeConfig) -> Page {
    page_with_host(config, MockPage::new(true, true))
}

pub fn page_with_host(config: BridgeConfig, host: Arc<MockPage>) -> Page {
    let wire = Wire::new(&config.channel_name);
    let provider =
        EthereumProvider::new(&config, wire.page_outbox.clone(), host.clone()).expect("provider");
    Page {
        provider,
        wire,
        host,
    }
}

/// Collects `(event, payload)` pairs for the listed events.
pub fn record(provider: &EthereumProvider, events: &[&'static str]) -> Arc<StdMutex<Vec<(String, Value)>>> {
    let seen = Arc::new(StdMutex::new(Vec::new()));
    for &event in events {
        let seen = Arc::clone(&seen);
        provider.on(event, move |payload| {
            seen.lock()
                .expect("seen mutex poisoned")
                .push((event.to_string(), payload.clone()));
        });
    }
    seen
}

pub fn names(seen: &StdMutex<Vec<(String, Value)>>) -> Vec<String> {
    seen.lock()
        .expect("seen mutex poisoned")
        .iter()
        .map(|(name, _)| name.clone())
        .collect()
}
