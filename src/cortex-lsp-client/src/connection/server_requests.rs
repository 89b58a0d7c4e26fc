//! Requests initiated by the backend.
//!
//! These are answered from local state and never go through the forward
//! request table.

use lsp_types::{
    ConfigurationParams, RegistrationParams, UnregistrationParams, WorkDoneProgressCreateParams,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace};

use super::{Connection, ServerNotification};
use crate::jsonrpc::{INVALID_PARAMS, ResponseError};

/// A parsed backend-to-client request.
#[derive(Debug)]
pub enum ServerRequest {
    /// `workspace/configuration`
    Configuration(ConfigurationParams),
    /// `client/registerCapability`
    RegisterCapability(RegistrationParams),
    /// `client/unregisterCapability`
    UnregisterCapability(UnregistrationParams),
    /// `window/workDoneProgress/create`
    WorkDoneProgressCreate(WorkDoneProgressCreateParams),
    /// `workspace/semanticTokens/refresh`
    SemanticTokensRefresh,
    Unknown(String),
}

fn params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, ResponseError> {
    serde_json::from_value(params)
        .map_err(|e| ResponseError::new(INVALID_PARAMS, format!("invalid params for {}: {}", method, e)))
}

impl ServerRequest {
    pub fn parse(method: &str, raw: Value) -> Result<Self, ResponseError> {
        Ok(match method {
            "workspace/configuration" => ServerRequest::Configuration(params(method, raw)?),
            "client/registerCapability" => ServerRequest::RegisterCapability(params(method, raw)?),
            "client/unregisterCapability" => {
                ServerRequest::UnregisterCapability(params(method, raw)?)
            }
            "window/workDoneProgress/create" => {
                ServerRequest::WorkDoneProgressCreate(params(method, raw)?)
            }
            "workspace/semanticTokens/refresh" => ServerRequest::SemanticTokensRefresh,
            other => ServerRequest::Unknown(other.to_string()),
        })
    }
}

impl Connection {
    /// Produce the reply for a backend request.
    pub(super) fn answer_server_request(&self, request: ServerRequest) -> Result<Value, ResponseError> {
        match request {
            ServerRequest::Configuration(params) => {
                let items = params
                    .items
                    .iter()
                    .map(|item| match self.language() {
                        Some(language) => language.settings_section(item.section.as_deref()),
                        None => Value::Null,
                    })
                    .collect();
                Ok(Value::Array(items))
            }
            ServerRequest::RegisterCapability(params) => {
                let mut capabilities = self.capabilities.write();
                for registration in &params.registrations {
                    let known =
                        capabilities.register(&registration.method, registration.register_options.as_ref());
                    debug!(
                        backend = ?self.backend(),
                        method = %registration.method,
                        known,
                        "Backend registered capability"
                    );
                }
                Ok(Value::Null)
            }
            ServerRequest::UnregisterCapability(params) => {
                let mut capabilities = self.capabilities.write();
                for unregistration in &params.unregisterations {
                    capabilities.unregister(&unregistration.method);
                }
                Ok(Value::Null)
            }
            ServerRequest::WorkDoneProgressCreate(params) => {
                trace!(token = ?params.token, "Progress token created");
                Ok(Value::Null)
            }
            ServerRequest::SemanticTokensRefresh => {
                self.broadcast(ServerNotification::SemanticTokensRefresh);
                Ok(Value::Null)
            }
            ServerRequest::Unknown(method) => {
                debug!(method = %method, "Unhandled backend request");
                Err(ResponseError::method_not_found(&method))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_and_unknown() {
        let request = ServerRequest::parse(
            "workspace/configuration",
            json!({ "items": [{ "section": "pylsp" }] }),
        )
        .unwrap();
        assert!(matches!(request, ServerRequest::Configuration(ref p) if p.items.len() == 1));

        let request = ServerRequest::parse(
            "client/registerCapability",
            json!({ "registrations": [{ "id": "1", "method": "textDocument/hover" }] }),
        )
        .unwrap();
        assert!(matches!(request, ServerRequest::RegisterCapability(_)));

        let request = ServerRequest::parse("workspace/applyEdit", json!({})).unwrap();
        assert!(matches!(request, ServerRequest::Unknown(ref m) if m == "workspace/applyEdit"));
    }

    #[test]
    fn test_invalid_params() {
        let err = ServerRequest::parse("workspace/configuration", json!({ "items": 3 })).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }
}
