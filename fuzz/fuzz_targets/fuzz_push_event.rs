//! Coverage-guided harness for unsolicited extension pushes.
//!
//! Drives a ready provider with arbitrary sequences of `message` frames and
//! checks the state invariants the router maintains: the selected address
//! is always the first known account, and nothing panics on malformed data.

#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use serde_json::{Value, json};
use unhosted::provider::{
    BridgeConfig, EthereumProvider, Frame, PageHost, PageMetadata, Transport, TransportError,
    Visibility,
};

/// Event name selector. `Raw` covers unknown names and generic re-emission.
#[derive(Arbitrary, Debug)]
enum EventName {
    Connect,
    Disconnect,
    AccountsChanged,
    ChainChanged,
    ChainMetadata,
    Lock,
    Unlock,
    Raw(String),
}

#[derive(Arbitrary, Debug)]
struct Push {
    name: EventName,
    /// JSON text for the payload; invalid JSON becomes a string payload.
    data: String,
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    initialize: bool,
    pushes: Vec<Push>,
}

struct Sink;

impl Transport for Sink {
    fn post(&self, _frame: &Frame) -> Result<(), TransportError> {
        Ok(())
    }
}

struct Page;

impl PageHost for Page {
    fn visibility(&self) -> Visibility {
        Visibility::Visible
    }

    fn is_document_ready(&self) -> bool {
        true
    }

    fn page_metadata(&self) -> PageMetadata {
        PageMetadata::default()
    }
}

fuzz_target!(|input: FuzzInput| {
    if input.pushes.len() > 64 {
        return;
    }
    let total_bytes: usize = input.pushes.iter().map(|push| push.data.len()).sum();
    if total_bytes > 64 * 1024 {
        return;
    }

    let Ok(provider) = EthereumProvider::new(&BridgeConfig::new("fuzz"), Arc::new(Sink), Arc::new(Page)) else {
        return;
    };
    provider.mark_ready();
    if input.initialize {
        // Handshake never answered; the future is dropped.
        drop(provider.initialize());
    }

    for push in input.pushes {
        let name = match push.name {
            EventName::Connect => "connect".to_string(),
            EventName::Disconnect => "disconnect".to_string(),
            EventName::AccountsChanged => "accountsChanged".to_string(),
            EventName::ChainChanged => "chainChanged".to_string(),
            EventName::ChainMetadata => "unhosted:chainChanged".to_string(),
            EventName::Lock => "lock".to_string(),
            EventName::Unlock => "unlock".to_string(),
            EventName::Raw(name) => name,
        };
        let data = serde_json::from_str::<Value>(&push.data).unwrap_or(Value::String(push.data));
        provider.handle_frame(Frame::Message(json!({ "event": name, "data": data })));

        let state = provider.state();
        let first = state.accounts.as_ref().and_then(|accounts| accounts.first().cloned());
        if state.accounts.is_some() {
            assert_eq!(state.selected_address, first);
        }
    }
});
