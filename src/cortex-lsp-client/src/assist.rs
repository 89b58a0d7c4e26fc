//! Client for the AI completion backend.
//!
//! Shares the connection plumbing with language backends but speaks its own
//! method set.

use std::sync::Arc;

use lsp_types::{Position, Range, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::connection::{Connection, ConnectionState};
use crate::{LspError, Result};

/// Authentication state reported by `checkStatus` and `signInConfirm`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AssistStatus {
    pub status: String,
    #[serde(default)]
    pub user: Option<String>,
}

impl AssistStatus {
    pub fn is_signed_in(&self) -> bool {
        matches!(self.status.as_str(), "OK" | "AlreadySignedIn")
    }
}

/// Device-flow prompt returned by `signInInitiate`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInPrompt {
    pub status: String,
    #[serde(default)]
    pub user_code: Option<String>,
    #[serde(default)]
    pub verification_uri: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

/// One inline suggestion.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistCompletion {
    pub uuid: String,
    pub text: String,
    #[serde(default)]
    pub display_text: Option<String>,
    pub range: Range,
    pub position: Position,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionsResponse {
    #[serde(default)]
    completions: Vec<AssistCompletion>,
}

/// Document context sent with `getCompletions`.
#[derive(Debug, Clone)]
pub struct AssistDocument {
    pub uri: Url,
    pub version: i32,
    pub language_id: String,
    pub relative_path: String,
    pub position: Position,
    pub tab_size: u32,
    pub insert_spaces: bool,
}

/// Typed wrapper over an AI completion backend connection.
pub struct AssistClient {
    connection: Arc<Connection>,
}

impl AssistClient {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.connection.state() {
            ConnectionState::Ready => Ok(()),
            state => Err(LspError::NotReady(state)),
        }
    }

    pub async fn check_status(&self) -> Result<AssistStatus> {
        self.ensure_ready()?;
        self.connection.send_request("checkStatus", json!({})).await
    }

    pub async fn sign_in_initiate(&self) -> Result<SignInPrompt> {
        self.ensure_ready()?;
        self.connection.send_request("signInInitiate", json!({})).await
    }

    pub async fn sign_in_confirm(&self, user_code: &str) -> Result<AssistStatus> {
        self.ensure_ready()?;
        self.connection
            .send_request("signInConfirm", json!({ "userCode": user_code }))
            .await
    }

    pub async fn sign_out(&self) -> Result<AssistStatus> {
        self.ensure_ready()?;
        self.connection.send_request("signOut", json!({})).await
    }

    /// Suggestions at the document position. Failures yield no suggestions.
    pub async fn get_completions(&self, document: &AssistDocument) -> Vec<AssistCompletion> {
        if let Err(e) = self.ensure_ready() {
            debug!(error = %e, "Assist backend unavailable");
            return Vec::new();
        }

        let params = json!({
            "doc": {
                "uri": document.uri,
                "version": document.version,
                "languageId": document.language_id,
                "relativePath": document.relative_path,
                "position": document.position,
                "tabSize": document.tab_size,
                "insertSpaces": document.insert_spaces,
            }
        });

        match self
            .connection
            .send_request::<_, Option<CompletionsResponse>>("getCompletions", params)
            .await
        {
            Ok(response) => response.unwrap_or_default().completions,
            Err(e) => {
                debug!(uri = %document.uri, error = %e, "getCompletions failed");
                Vec::new()
            }
        }
    }

    pub async fn notify_accepted(&self, uuid: &str) -> Result<()> {
        self.ensure_ready()?;
        let _: serde_json::Value = self
            .connection
            .send_request("notifyAccepted", json!({ "uuid": uuid }))
            .await?;
        Ok(())
    }

    pub async fn notify_rejected(&self, uuids: &[String]) -> Result<()> {
        self.ensure_ready()?;
        let _: serde_json::Value = self
            .connection
            .send_request("notifyRejected", json!({ "uuids": uuids }))
            .await?;
        Ok(())
    }
}
