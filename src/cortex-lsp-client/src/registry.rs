//! Registry of live backend connections.
//!
//! Owned by the application root and passed to whoever needs a connection.
//! A connection is created on the first request for its backend and lives
//! until it is shut down explicitly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lsp_types::Url;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{BackendId, Connection, ConnectionState};
use crate::language::Language;
use crate::transport::Transport;
use crate::Result;

/// Supplies a transport for a backend, e.g. by handing over the pipes of a
/// process the supervisor spawned.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, backend: &BackendId) -> Result<Arc<dyn Transport>>;
}

/// Connections keyed by backend identity.
pub struct ConnectionRegistry {
    factory: Arc<dyn TransportFactory>,
    config: Arc<ClientConfig>,
    root: Option<PathBuf>,
    connections: Mutex<HashMap<BackendId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, config: ClientConfig) -> Self {
        Self {
            factory,
            config: Arc::new(config),
            root: None,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Set the workspace root sent during initialize.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Connection for `backend`, creating it and starting its handshake on
    /// first use. The handshake runs in the background; callers that need a
    /// Ready connection await [`Connection::wait_ready`].
    ///
    /// A connection that closed is replaced; one whose handshake failed is
    /// returned as is and never retried.
    pub async fn get_or_connect(&self, backend: BackendId) -> Result<Arc<Connection>> {
        let mut connections = self.connections.lock().await;

        if let Some(connection) = connections.get(&backend) {
            if connection.state() != ConnectionState::Closed {
                return Ok(connection.clone());
            }
            debug!(?backend, "Replacing closed connection");
        }

        let transport = self.factory.connect(&backend).await?;
        let connection = Connection::new(backend, transport, self.config.clone());
        connections.insert(backend, connection.clone());
        drop(connections);

        let root = self.root.as_deref().and_then(|root| Url::from_file_path(root).ok());
        let handshake = connection.clone();
        tokio::spawn(async move {
            if let Err(e) = handshake.initialize(root).await {
                warn!(?backend, error = %e, "Backend failed to initialize");
            }
        });

        info!(?backend, "Started backend connection");
        Ok(connection)
    }

    /// Connection for the language backend serving `path`, if any.
    pub async fn connect_for_path(&self, path: &Path) -> Result<Option<Arc<Connection>>> {
        match Language::from_path(path) {
            Some(language) => self.get_or_connect(BackendId::Language(language)).await.map(Some),
            None => Ok(None),
        }
    }

    /// Existing connection for `backend`, without creating one.
    pub async fn get(&self, backend: BackendId) -> Option<Arc<Connection>> {
        self.connections.lock().await.get(&backend).cloned()
    }

    pub async fn backends(&self) -> Vec<BackendId> {
        self.connections.lock().await.keys().copied().collect()
    }

    /// Shut down and forget the connection for `backend`.
    pub async fn shutdown(&self, backend: BackendId) -> Result<()> {
        let connection = self.connections.lock().await.remove(&backend);
        match connection {
            Some(connection) => connection.shutdown().await,
            None => Ok(()),
        }
    }

    /// Shut down every connection.
    pub async fn shutdown_all(&self) {
        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        for (backend, connection) in connections {
            if let Err(e) = connection.shutdown().await {
                warn!(?backend, error = %e, "Error shutting down backend");
            }
        }
    }
}
