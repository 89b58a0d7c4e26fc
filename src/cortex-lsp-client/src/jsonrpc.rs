//! JSON-RPC message model and `Content-Length` framing.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{LspError, Result};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC request id. Our own requests always use numbers; backends may use strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Unhandled method {}", method))
    }
}

impl From<ResponseError> for LspError {
    fn from(error: ResponseError) -> Self {
        LspError::ResponseError {
            code: error.code,
            message: error.message,
        }
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: RequestId,
        result: std::result::Result<Value, ResponseError>,
    },
}

impl Message {
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Message::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: RequestId, result: std::result::Result<Value, ResponseError>) -> Self {
        Message::Response { id, result }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            Message::Response { .. } => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Message::Request { id, method, params } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }),
            Message::Notification { method, params } => json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
            }),
            Message::Response { id, result } => match result {
                Ok(value) => json!({ "jsonrpc": "2.0", "id": id, "result": value }),
                Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
            },
        }
    }

    pub fn from_value(mut value: Value) -> Result<Self> {
        let Some(object) = value.as_object_mut() else {
            return Err(LspError::MalformedResponse("message is not an object".into()));
        };

        let id = match object.remove("id") {
            Some(Value::Null) | None => None,
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw)
                    .map_err(|e| LspError::MalformedResponse(format!("bad id: {}", e)))?,
            ),
        };
        let params = object.remove("params").unwrap_or(Value::Null);

        if let Some(method) = object.remove("method") {
            let method = method
                .as_str()
                .ok_or_else(|| LspError::MalformedResponse("method is not a string".into()))?
                .to_string();
            return Ok(match id {
                Some(id) => Message::Request { id, method, params },
                None => Message::Notification { method, params },
            });
        }

        let id = id.ok_or_else(|| LspError::MalformedResponse("response without id".into()))?;
        if let Some(error) = object.remove("error") {
            let error: ResponseError = serde_json::from_value(error)
                .map_err(|e| LspError::MalformedResponse(format!("bad error object: {}", e)))?;
            return Ok(Message::Response {
                id,
                result: Err(error),
            });
        }

        Ok(Message::Response {
            id,
            result: Ok(object.remove("result").unwrap_or(Value::Null)),
        })
    }
}

/// Write one framed message.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let content = serde_json::to_string(&message.to_value())?;
    let header = format!("Content-Length: {}\r\n\r\n", content.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(content.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. Returns `Ok(None)` on a clean EOF between messages.
///
/// Waiting for the first header line is unbounded (an idle backend is normal);
/// once a message has started, the body must arrive within `read_timeout`.
pub async fn read_message<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    read_timeout: Duration,
    max_content_length: usize,
) -> Result<Option<Message>> {
    let mut content_length: Option<usize> = None;
    let mut started = false;

    loop {
        let mut line = String::new();
        let read = if started {
            tokio::time::timeout(read_timeout, reader.read_line(&mut line))
                .await
                .map_err(|_| LspError::MalformedResponse("timeout reading headers".into()))??
        } else {
            reader.read_line(&mut line).await?
        };

        if read == 0 {
            if started {
                return Err(LspError::TransportFailure("EOF inside message headers".into()));
            }
            return Ok(None);
        }
        started = true;

        if line == "\r\n" || line == "\n" {
            break;
        }

        if let Some(len_str) = line.strip_prefix("Content-Length:") {
            let length: usize = len_str
                .trim()
                .parse()
                .map_err(|e| LspError::MalformedResponse(format!("Invalid Content-Length: {}", e)))?;

            if length > max_content_length {
                return Err(LspError::MalformedResponse(format!(
                    "Content-Length {} exceeds maximum allowed {}",
                    length, max_content_length
                )));
            }
            content_length = Some(length);
        }
    }

    let content_length = content_length
        .filter(|len| *len > 0)
        .ok_or_else(|| LspError::MalformedResponse("no Content-Length header".into()))?;

    let mut content = vec![0u8; content_length];
    tokio::time::timeout(read_timeout, reader.read_exact(&mut content))
        .await
        .map_err(|_| LspError::MalformedResponse("timeout reading content".into()))??;

    // The frame was consumed whole, so a bad body leaves the stream in sync.
    let value: Value = serde_json::from_slice(&content).map_err(|e| LspError::InvalidMessage {
        id: None,
        reason: format!("JSON parse error: {}", e),
    })?;
    let id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
    Message::from_value(value)
        .map(Some)
        .map_err(|e| LspError::InvalidMessage {
            id,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::BufReader;

    #[test]
    fn test_classify_messages() {
        let request = Message::from_value(json!({
            "jsonrpc": "2.0", "id": "abc", "method": "workspace/configuration", "params": {}
        }))
        .unwrap();
        assert_eq!(
            request,
            Message::request(
                RequestId::String("abc".into()),
                "workspace/configuration",
                json!({})
            )
        );

        let notification = Message::from_value(json!({
            "jsonrpc": "2.0", "method": "window/logMessage", "params": { "type": 3, "message": "hi" }
        }))
        .unwrap();
        assert_eq!(notification.method(), Some("window/logMessage"));

        let response = Message::from_value(json!({ "jsonrpc": "2.0", "id": 7, "result": null })).unwrap();
        assert_eq!(response, Message::response(RequestId::Number(7), Ok(Value::Null)));

        let failed = Message::from_value(json!({
            "jsonrpc": "2.0", "id": 8, "error": { "code": -32601, "message": "nope" }
        }))
        .unwrap();
        assert_eq!(
            failed,
            Message::response(
                RequestId::Number(8),
                Err(ResponseError::new(METHOD_NOT_FOUND, "nope"))
            )
        );
    }

    #[test]
    fn test_response_without_id_is_malformed() {
        let err = Message::from_value(json!({ "jsonrpc": "2.0", "result": 1 })).unwrap_err();
        assert!(matches!(err, LspError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_framing() {
        let mut buffer = Vec::new();
        let message = Message::notification("initialized", json!({}));
        write_message(&mut buffer, &message).await.unwrap();
        write_message(&mut buffer, &Message::response(RequestId::Number(1), Ok(json!(42))))
            .await
            .unwrap();

        let mut reader = BufReader::new(buffer.as_slice());
        let first = read_message(&mut reader, Duration::from_secs(1), 1024).await.unwrap();
        assert_eq!(first, Some(message));
        let second = read_message(&mut reader, Duration::from_secs(1), 1024).await.unwrap();
        assert_eq!(second, Some(Message::response(RequestId::Number(1), Ok(json!(42)))));
        let eof = read_message(&mut reader, Duration::from_secs(1), 1024).await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn test_bad_body_keeps_stream_in_sync() {
        let mut raw = b"Content-Length: 10\r\n\r\n{not json}".to_vec();
        raw.extend_from_slice(b"Content-Length: 34\r\n\r\n{\"jsonrpc\":\"2.0\",\"id\":4,\"error\":7}");
        let mut buffer = Vec::new();
        write_message(&mut buffer, &Message::response(RequestId::Number(5), Ok(json!(1))))
            .await
            .unwrap();
        raw.extend_from_slice(&buffer);

        let mut reader = BufReader::new(raw.as_slice());
        let err = read_message(&mut reader, Duration::from_secs(1), 1024).await.unwrap_err();
        assert!(matches!(err, LspError::InvalidMessage { id: None, .. }));

        let err = read_message(&mut reader, Duration::from_secs(1), 1024).await.unwrap_err();
        assert!(matches!(
            err,
            LspError::InvalidMessage {
                id: Some(RequestId::Number(4)),
                ..
            }
        ));

        let next = read_message(&mut reader, Duration::from_secs(1), 1024).await.unwrap();
        assert_eq!(next, Some(Message::response(RequestId::Number(5), Ok(json!(1)))));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let raw = b"Content-Length: 4096\r\n\r\n{}";
        let mut reader = BufReader::new(&raw[..]);
        let err = read_message(&mut reader, Duration::from_secs(1), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::MalformedResponse(_)));
    }
}
