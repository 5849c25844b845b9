//! Page notices (chain-switch and default-wallet banners).
//!
//! Rendering belongs to the host; this module decides what to show and owns
//! the single live notice so a new one always replaces the previous.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde_json::Value;

/// Auto-hide delay for chain-switch notices.
pub const CHAIN_SWITCH_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkDirection {
    TestnetToMainnet,
    MainnetToTestnet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSwitch {
    pub chain_name: String,
    pub direction: Option<NetworkDirection>,
}

impl ChainSwitch {
    /// Reads a chain record `{name, isTestnet, prev?: {isTestnet}}`.
    #[must_use]
    pub fn from_chain(chain: &Value) -> Self {
        let is_testnet = |value: &Value| value.get("isTestnet").and_then(Value::as_bool) == Some(true);
        let direction = chain.get("prev").filter(|prev| prev.is_object()).and_then(|prev| {
            match (is_testnet(prev), is_testnet(chain)) {
                (true, false) => Some(NetworkDirection::TestnetToMainnet),
                (false, true) => Some(NetworkDirection::MainnetToTestnet),
                _ => None,
            }
        });
        Self {
            chain_name: chain
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            direction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletKind {
    Unhosted,
    MetaMask,
}

impl WalletKind {
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.as_str()? {
            "unhosted" => Some(Self::Unhosted),
            "metamask" => Some(Self::MetaMask),
            _ => None,
        }
    }

    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Unhosted => "Unhosted",
            Self::MetaMask => "MetaMask",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ChainSwitch(ChainSwitch),
    /// Sticky until closed; asks the user to reload.
    DefaultWallet(WalletKind),
}

impl Notice {
    /// `None` means the notice stays until the user closes it.
    #[must_use]
    pub const fn timeout_ms(&self) -> Option<u64> {
        match self {
            Self::ChainSwitch(_) => Some(CHAIN_SWITCH_TIMEOUT_MS),
            Self::DefaultWallet(_) => None,
        }
    }

    #[must_use]
    pub const fn closeable(&self) -> bool {
        matches!(self, Self::DefaultWallet(_))
    }
}

pub trait NoticeHandle: Send {
    fn hide(&mut self);
}

pub trait NoticeRenderer: Send + Sync {
    fn show(&self, notice: &Notice) -> Box<dyn NoticeHandle>;

    /// Frames sharing the top window's origin leave notices to the top frame.
    fn in_same_origin_iframe(&self) -> bool;
}

/// Owner of the one live notice.
pub struct NoticeSlot {
    renderer: Arc<dyn NoticeRenderer>,
    current: StdMutex<Option<Box<dyn NoticeHandle>>>,
}

impl std::fmt::Debug for NoticeSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoticeSlot")
            .field("showing", &self.is_showing())
            .finish_non_exhaustive()
    }
}

impl NoticeSlot {
    #[must_use]
    pub fn new(renderer: Arc<dyn NoticeRenderer>) -> Self {
        Self {
            renderer,
            current: StdMutex::new(None),
        }
    }

    /// Hides the current notice, then shows `notice`. Returns false when
    /// notices are suppressed for this frame.
    pub fn show(&self, notice: &Notice) -> bool {
        if self.renderer.in_same_origin_iframe() {
            return false;
        }
        self.hide();
        let handle = self.renderer.show(notice);
        *self.current.lock().expect("notice slot mutex poisoned") = Some(handle);
        true
    }

    pub fn hide(&self) {
        let previous = self
            .current
            .lock()
            .expect("notice slot mutex poisoned")
            .take();
        if let Some(mut handle) = previous {
            handle.hide();
        }
    }

    #[must_use]
    pub fn is_showing(&self) -> bool {
        self.current
            .lock()
            .expect("notice slot mutex poisoned")
            .is_some()
    }

    pub fn show_chain_switch(&self, chain: &Value) -> bool {
        self.show(&Notice::ChainSwitch(ChainSwitch::from_chain(chain)))
    }

    pub fn show_default_wallet(&self, kind: &Value) -> bool {
        match WalletKind::from_value(kind) {
            Some(kind) => self.show(&Notice::DefaultWallet(kind)),
            None => {
                tracing::debug!(?kind, "ignoring default wallet notice for unknown wallet");
                false
            }
        }
    }
}
