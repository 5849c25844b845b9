//! Pre-EIP-1193 call surface.
//!
//! Older dapps call `send`, `sendAsync`, `enable` and `net_version` instead of
//! `request`. Each form is normalized to a `{method, params}` payload and
//! goes through [`EthereumProvider::request`]; only the response envelope
//! differs.

use std::future::Future;

use futures::future::{Either, join_all};
use serde_json::{Map, Value, json};

use super::{EthereumProvider, ProviderError};

impl EthereumProvider {
    /// `send(method, params)`: resolves to `{id: null, jsonrpc: "2.0", result}`.
    pub fn send_method(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> impl Future<Output = Result<Value, ProviderError>> + use<> {
        let mut payload = json!({ "method": method });
        if let Some(params) = params {
            payload["params"] = params;
        }
        let pending = self.request(payload);
        async move {
            let result = pending.await?;
            Ok(json!({ "id": Value::Null, "jsonrpc": "2.0", "result": result }))
        }
    }

    /// `sendAsync(payload)`: the response object carries the caller's extra
    /// fields plus `method` and either `result` or `error`. A batch runs
    /// every element and resolves to the array of responses; a failing
    /// element never fails the batch.
    pub fn send_async(&self, payload: Value) -> impl Future<Output = Value> + use<> {
        match payload {
            Value::Array(items) => {
                let pending: Vec<_> = items.into_iter().map(|item| self.send_one(item)).collect();
                Either::Right(async move { Value::Array(join_all(pending).await) })
            }
            single => Either::Left(self.send_one(single)),
        }
    }

    fn send_one(&self, payload: Value) -> impl Future<Output = Value> + use<> {
        let mut rest = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let method = rest.remove("method").unwrap_or(Value::Null);
        let params = rest.remove("params");

        let mut normalized = Map::new();
        if !method.is_null() {
            normalized.insert("method".to_string(), method.clone());
        }
        if let Some(params) = params {
            normalized.insert("params".to_string(), params);
        }
        let request = if normalized.is_empty() {
            Value::Null
        } else {
            Value::Object(normalized)
        };
        let pending = self.request(request);

        async move {
            let outcome = pending.await;
            rest.insert("method".to_string(), method);
            match outcome {
                Ok(result) => {
                    rest.insert("result".to_string(), result);
                }
                Err(err) => {
                    let error = serde_json::to_value(err.to_rpc()).unwrap_or(Value::Null);
                    rest.insert("error".to_string(), error);
                }
            }
            Value::Object(rest)
        }
    }

    /// Synchronous `send(payload)`. Only account queries can be answered
    /// without a round trip.
    pub fn send_sync(&self, payload: &Value) -> Result<Value, ProviderError> {
        let method = payload
            .get("method")
            .and_then(Value::as_str)
            .ok_or(ProviderError::InvalidRequest)?;
        let selected = self.selected_address();
        let result = match method {
            "eth_accounts" => json!(selected.into_iter().collect::<Vec<_>>()),
            "eth_coinbase" => json!(selected),
            other => return Err(ProviderError::UnsupportedSyncMethod(other.to_string())),
        };
        Ok(json!({
            "id": payload.get("id").cloned().unwrap_or(Value::Null),
            "jsonrpc": payload.get("jsonrpc").cloned().unwrap_or(Value::Null),
            "result": result,
        }))
    }

    pub fn enable(&self) -> impl Future<Output = Result<Value, ProviderError>> + use<> {
        self.request(json!({ "method": "eth_requestAccounts" }))
    }

    pub fn net_version(&self) -> impl Future<Output = Result<Value, ProviderError>> + use<> {
        self.request(json!({ "method": "net_version" }))
    }

    /// Always true: the page cannot observe the extension going away.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        true
    }
}
