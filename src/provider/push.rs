//! Unsolicited extension pushes and their effect on provider state.
//!
//! Known event names parse into [`PushEvent`]; anything else is carried as
//! [`PushEvent::Other`] and re-emitted verbatim. Emissions from the known
//! handlers are dropped until the provider is both initialized and ready;
//! generic re-emission is not gated.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde::Deserialize;
use serde_json::{Value, json};

use super::ProviderState;
use super::events::EventEmitter;
use super::protocol::{PushMessage, RpcError};

pub const CHAIN_METADATA_EVENT: &str = "unhosted:chainChanged";

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Connect(Value),
    Disconnect,
    AccountsChanged(Option<Vec<String>>),
    ChainChanged {
        chain: Option<String>,
        network_version: Option<String>,
    },
    Lock,
    Unlock,
    /// Extended chain record (`{hex, name, isTestnet, prev?, ..}`).
    ChainMetadataChanged(Value),
    Other {
        name: String,
        data: Value,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ChainChangedPayload {
    chain: Option<String>,
    network_version: Option<String>,
}

impl PushEvent {
    /// Classifies a push by name. Fails only when a known event carries a
    /// payload of the wrong shape.
    pub fn parse(name: &str, data: Value) -> Result<Self, serde_json::Error> {
        Ok(match name {
            "connect" => Self::Connect(data),
            "disconnect" => Self::Disconnect,
            "accountsChanged" => Self::AccountsChanged(serde_json::from_value(data)?),
            "chainChanged" => {
                let payload: ChainChangedPayload = if data.is_null() {
                    ChainChangedPayload::default()
                } else {
                    serde_json::from_value(data)?
                };
                Self::ChainChanged {
                    chain: payload.chain,
                    network_version: payload.network_version,
                }
            }
            "lock" => Self::Lock,
            "unlock" => Self::Unlock,
            CHAIN_METADATA_EVENT => Self::ChainMetadataChanged(data),
            _ => Self::Other {
                name: name.to_string(),
                data,
            },
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Connect(_) => "connect",
            Self::Disconnect => "disconnect",
            Self::AccountsChanged(_) => "accountsChanged",
            Self::ChainChanged { .. } => "chainChanged",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::ChainMetadataChanged(_) => CHAIN_METADATA_EVENT,
            Self::Other { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushEventRouter {
    state: Arc<StdMutex<ProviderState>>,
    emitter: Arc<EventEmitter>,
}

impl PushEventRouter {
    #[must_use]
    pub fn new(state: Arc<StdMutex<ProviderState>>, emitter: Arc<EventEmitter>) -> Self {
        Self { state, emitter }
    }

    /// Entry point for the body of a `message` frame.
    pub fn dispatch_message(&self, body: Value) {
        match serde_json::from_value::<PushMessage>(body) {
            Ok(message) => self.dispatch(&message.event, message.data),
            Err(err) => tracing::warn!("dropping malformed push message: {err}"),
        }
    }

    pub fn dispatch(&self, name: &str, data: Value) {
        tracing::debug!(event = name, "push event");
        match PushEvent::parse(name, data) {
            Ok(event) => self.handle(event),
            Err(err) => tracing::warn!(event = name, "dropping push with bad payload: {err}"),
        }
    }

    pub fn handle(&self, event: PushEvent) {
        match event {
            PushEvent::Connect(data) => self.connect(data),
            PushEvent::Disconnect => self.disconnect(),
            PushEvent::AccountsChanged(accounts) => self.accounts_changed(accounts),
            PushEvent::ChainChanged {
                chain,
                network_version,
            } => self.chain_changed(chain, network_version),
            PushEvent::Lock => self.lock_state().is_unlocked = false,
            PushEvent::Unlock => self.lock_state().is_unlocked = true,
            PushEvent::ChainMetadataChanged(chain) => self.chain_metadata_changed(chain),
            PushEvent::Other { name, data } => {
                self.emitter.emit(&name, &data);
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state.lock().expect("provider state mutex poisoned")
    }

    fn emit_gated(&self, event: &str, payload: &Value) {
        let open = {
            let state = self.lock_state();
            state.is_initialized && state.is_ready
        };
        if open {
            self.emitter.emit(event, payload);
        } else {
            tracing::debug!(event, "suppressing push emission before ready");
        }
    }

    fn connect(&self, data: Value) {
        {
            let mut state = self.lock_state();
            if state.is_connected {
                return;
            }
            state.is_connected = true;
        }
        self.emit_gated("connect", &data);
    }

    fn disconnect(&self) {
        {
            let mut state = self.lock_state();
            state.is_connected = false;
            state.accounts = None;
            state.selected_address = None;
        }
        let error = serde_json::to_value(RpcError::disconnected()).unwrap_or(Value::Null);
        self.emit_gated("accountsChanged", &json!([]));
        self.emit_gated("disconnect", &error);
        self.emit_gated("close", &error);
    }

    fn accounts_changed(&self, accounts: Option<Vec<String>>) {
        {
            let mut state = self.lock_state();
            let primary = accounts.as_ref().and_then(|list| list.first().cloned());
            if primary == state.selected_address {
                return;
            }
            state.selected_address = primary;
            state.accounts.clone_from(&accounts);
        }
        let payload = accounts.map_or(Value::Null, |list| json!(list));
        self.emit_gated("accountsChanged", &payload);
    }

    fn chain_changed(&self, chain: Option<String>, network_version: Option<String>) {
        self.connect(json!({ "chainId": chain }));

        let (chain_differs, network_differs) = {
            let mut state = self.lock_state();
            let chain_differs = chain != state.chain_id;
            if chain_differs {
                state.chain_id.clone_from(&chain);
            }
            let network_differs = network_version != state.network_version;
            if network_differs {
                state.network_version.clone_from(&network_version);
            }
            (chain_differs, network_differs)
        };

        if chain_differs {
            self.emit_gated("chainChanged", &json!(chain));
        }
        if network_differs {
            self.emit_gated("networkChanged", &json!(network_version));
        }
    }

    fn chain_metadata_changed(&self, chain: Value) {
        if chain.is_null() {
            return;
        }
        let incoming = chain
            .get("hex")
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase);
        let current = self
            .lock_state()
            .chain_id
            .as_deref()
            .map(str::to_ascii_lowercase);
        if incoming != current {
            self.emit_gated(CHAIN_METADATA_EVENT, &chain);
        }
    }
}
