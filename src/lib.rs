//! Page-side bridge between dapp scripts and the Unhosted wallet extension.
//!
//! The [`provider`] module holds the EIP-1193 request pipeline and push-event
//! routing; [`logging`] sets up tracing for hosts that embed it.

pub mod logging;
pub mod provider;

pub use provider::{BridgeConfig, EthereumProvider, ProviderError};
