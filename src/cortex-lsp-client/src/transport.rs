//! Transport layer between a connection and its backend.
//!
//! Process supervision lives elsewhere; a transport only moves framed
//! messages over a duplex channel it was handed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ClientConfig;
use crate::jsonrpc::{self, Message};
use crate::{LspError, Result};

/// Asynchronous duplex message channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message.
    async fn send(&self, message: Message) -> Result<()>;

    /// Receive the next inbound message; `Ok(None)` means the peer closed the channel.
    async fn recv(&self) -> Result<Option<Message>>;

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}

/// `Content-Length` framed transport over any reader/writer pair,
/// typically the stdio pipes of an already spawned backend.
pub struct StreamTransport<R, W> {
    reader: Mutex<BufReader<R>>,
    writer: Mutex<Option<W>>,
    read_timeout: Duration,
    max_content_length: usize,
    closed: AtomicBool,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, config: &ClientConfig) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(Some(writer)),
            read_timeout: config.read_timeout,
            max_content_length: config.max_content_length,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(LspError::TransportFailure("transport closed".into()));
        };
        jsonrpc::write_message(writer, &message)
            .await
            .map_err(|e| LspError::TransportFailure(e.to_string()))?;
        debug!(method = message.method().unwrap_or("<response>"), "Sent message");
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Message>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        jsonrpc::read_message(&mut *reader, self.read_timeout, self.max_content_length).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}
