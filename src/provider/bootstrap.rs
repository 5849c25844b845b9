//! One-time page bootstrap.
//!
//! Consumes the transient configuration, builds and readies the provider,
//! wires notices, asks the extension about competing wallets and announces
//! the wallet identity for EIP-6963 discovery. Everything else the page
//! needs after this point goes through the returned [`Bootstrapped`].

use std::sync::Arc;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::notice::{NoticeRenderer, NoticeSlot};
use super::push::CHAIN_METADATA_EVENT;
use super::{BridgeConfig, EthereumProvider, PageHost, ProviderError, TransientStore, Transport};

pub const PROVIDER_NAME: &str = "Unhosted Wallet";
pub const PROVIDER_RDNS: &str = "io.unhosted";
pub const PROVIDER_ICON: &str = include_str!("../../assets/unhosted-icon.uri");

pub const DEFAULT_WALLET_CHANGED_EVENT: &str = "defaultWalletChanged";

/// EIP-6963 provider info record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub uuid: String,
    pub name: String,
    pub icon: String,
    pub rdns: String,
}

impl ProviderInfo {
    #[must_use]
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: PROVIDER_NAME.to_string(),
            icon: PROVIDER_ICON.to_string(),
            rdns: PROVIDER_RDNS.to_string(),
        }
    }
}

/// The page-global surface the bootstrap writes to.
pub trait WalletHost: Send + Sync {
    /// Another wallet already injected a provider into the page.
    fn has_injected_provider(&self) -> bool;

    /// Points the page's default provider at us (`true`) or back at the
    /// most recently injected other wallet.
    fn set_default_provider(&self, unhosted_as_default: bool);

    /// Broadcasts `eip6963:announceProvider`.
    fn announce_provider(&self, info: &ProviderInfo);
}

/// Collaborators handed to [`bootstrap`].
pub struct BootstrapHost {
    pub transport: Arc<dyn Transport>,
    pub page: Arc<dyn PageHost>,
    pub wallet: Arc<dyn WalletHost>,
    pub notices: Arc<dyn NoticeRenderer>,
}

/// A bootstrapped page. The two background tasks must be driven by the
/// host's executor; everything they need was dispatched eagerly.
pub struct Bootstrapped {
    pub provider: EthereumProvider,
    pub info: ProviderInfo,
    pub notices: Arc<NoticeSlot>,
    wallet: Arc<dyn WalletHost>,
    initialized: Option<LocalBoxFuture<'static, ()>>,
    default_wallet: Option<LocalBoxFuture<'static, ()>>,
}

impl std::fmt::Debug for Bootstrapped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapped")
            .field("provider", &self.provider)
            .field("info", &self.info.uuid)
            .finish_non_exhaustive()
    }
}

impl Bootstrapped {
    /// Handler for `eip6963:requestProvider`.
    pub fn announce_provider(&self) {
        self.wallet.announce_provider(&self.info);
    }

    /// Completes the provider-state handshake and applies the
    /// `isDefaultWallet` answer. Safe to call more than once.
    pub async fn settle(&mut self) {
        if let Some(initialized) = self.initialized.take() {
            initialized.await;
        }
        if let Some(default_wallet) = self.default_wallet.take() {
            default_wallet.await;
        }
    }
}

pub fn bootstrap(
    mut config: BridgeConfig,
    store: &mut dyn TransientStore,
    host: BootstrapHost,
) -> Result<Bootstrapped, ProviderError> {
    config.consume_transient(store);
    if config.uuid.is_empty() {
        config.uuid = uuid::Uuid::new_v4().to_string();
    }

    let provider = EthereumProvider::new(&config, host.transport, host.page)?;
    let initialized = provider.initialize().boxed_local();
    provider.mark_ready();

    let notices = Arc::new(NoticeSlot::new(host.notices));
    if config.is_opera {
        watch_chain_switches(&provider, &notices);
    } else {
        let slot = Arc::clone(&notices);
        provider.on(DEFAULT_WALLET_CHANGED_EVENT, move |kind| {
            slot.show_default_wallet(kind);
        });
        if host.wallet.has_injected_provider() {
            request_has_other_provider(&provider);
        }
    }

    let default_wallet = {
        let answer = provider.request_internal(json!({ "method": "isDefaultWallet", "params": [] }));
        let provider = provider.clone();
        let notices = Arc::clone(&notices);
        let wallet = Arc::clone(&host.wallet);
        let is_opera = config.is_opera;
        async move {
            let unhosted_as_default = match answer.await {
                Ok(value) => value.as_bool().unwrap_or(false),
                Err(err) => {
                    tracing::debug!("isDefaultWallet failed: {err}");
                    return;
                }
            };
            wallet.set_default_provider(unhosted_as_default);
            if unhosted_as_default && !is_opera {
                watch_chain_switches(&provider, &notices);
            }
        }
        .boxed_local()
    };

    let info = ProviderInfo::new(config.uuid.clone());
    host.wallet.announce_provider(&info);
    tracing::debug!(uuid = %info.uuid, opera = config.is_opera, "provider bootstrapped");

    Ok(Bootstrapped {
        provider,
        info,
        notices,
        wallet: host.wallet,
        initialized: Some(initialized),
        default_wallet: Some(default_wallet),
    })
}

/// Tells the extension another wallet is present. Fire and forget: the
/// request is already queued when the future is dropped.
pub fn request_has_other_provider(provider: &EthereumProvider) {
    drop(provider.request_internal(json!({ "method": "hasOtherProvider", "params": [] })));
}

fn watch_chain_switches(provider: &EthereumProvider, notices: &Arc<NoticeSlot>) {
    let slot = Arc::clone(notices);
    provider.on(CHAIN_METADATA_EVENT, move |chain: &Value| {
        slot.show_chain_switch(chain);
    });
}
