//! Bridge configuration.
//!
//! Values are injected into the page script at build/injection time and may
//! be overridden once through transient page storage (the extension writes
//! them just before a reload). [`BridgeConfig::consume_transient`] applies
//! and removes those overrides; after that the struct is passed explicitly
//! to the provider and never re-read from ambient state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::channel::DEFAULT_ID_POOL_SIZE;
use super::events::DEFAULT_MAX_LISTENERS;

// ============================================================================
// Transient storage keys
// ============================================================================

pub const CHANNEL_NAME_KEY: &str = "unhosted:channelName";
pub const IS_DEFAULT_WALLET_KEY: &str = "unhosted:isDefaultWallet";
pub const UUID_KEY: &str = "unhosted:uuid";
pub const IS_OPERA_KEY: &str = "unhosted:isOpera";

// ============================================================================
// TransientStore
// ============================================================================

/// Key/value storage read exactly once during bootstrap.
pub trait TransientStore {
    /// Removes `key` and returns its value. Empty values count as absent.
    fn take(&mut self, key: &str) -> Option<String>;
}

impl TransientStore for HashMap<String, String> {
    fn take(&mut self, key: &str) -> Option<String> {
        self.remove(key).filter(|value| !value.is_empty())
    }
}

// ============================================================================
// BridgeConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Name scoping the page <-> extension transport. Required.
    pub channel_name: String,

    /// Injected default-wallet hint, carried for parity with the injected
    /// config. Provider routing follows the extension's `isDefaultWallet`
    /// answer instead.
    pub is_default_wallet: bool,

    /// Identity announced to multi-wallet discovery. Generated when empty.
    pub uuid: String,

    /// Opera builds own `window.ethereum` outright and skip the router.
    pub is_opera: bool,

    /// Correlation id pool size, i.e. max in-flight requests per channel.
    pub id_pool_size: usize,

    /// Methods that admit only one in-flight request at a time.
    pub single_flight_methods: Vec<String>,

    /// Listener count per event above which a leak warning is logged.
    pub max_listeners: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_name: String::new(),
            is_default_wallet: false,
            uuid: String::new(),
            is_opera: false,
            id_pool_size: DEFAULT_ID_POOL_SIZE,
            single_flight_methods: Vec::new(),
            max_listeners: DEFAULT_MAX_LISTENERS,
        }
    }
}

impl BridgeConfig {
    #[must_use]
    pub fn new(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            ..Self::default()
        }
    }

    /// Applies and removes any transient overrides. Booleans are true only
    /// for the literal string `"true"`.
    pub fn consume_transient(&mut self, store: &mut dyn TransientStore) {
        if let Some(name) = store.take(CHANNEL_NAME_KEY) {
            self.channel_name = name;
        }
        if let Some(flag) = store.take(IS_DEFAULT_WALLET_KEY) {
            self.is_default_wallet = flag == "true";
        }
        if let Some(uuid) = store.take(UUID_KEY) {
            self.uuid = uuid;
        }
        if let Some(flag) = store.take(IS_OPERA_KEY) {
            self.is_opera = flag == "true";
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_name.trim().is_empty() {
            return Err(ConfigError::MissingChannelName);
        }
        if self.id_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "idPoolSize",
                reason: "must be > 0",
            });
        }
        if u32::try_from(self.id_pool_size).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "idPoolSize",
                reason: "must fit in a 32-bit correlation id",
            });
        }
        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("bridge config: channel name is missing")]
    MissingChannelName,

    #[error("bridge config: {field} {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

// ============================================================================
// Tests
// ============================================================================
