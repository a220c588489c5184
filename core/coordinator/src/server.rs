//! TCP listener: one reader thread per accepted client.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use crate::config::CoordinatorConfig;
use crate::connection::handle_connection;
use crate::db::Db;
use crate::registry::Registry;
use crate::CoordinatorError;

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    next_connection: AtomicU64,
}

impl Server {
    /// Opens the coordinator database under the configured data directory
    /// and binds the listening socket.
    pub fn bind(config: &CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let data_dir = config.data_dir().map_err(CoordinatorError::Config)?;
        fs_err::create_dir_all(&data_dir)?;
        let db = Db::new(config.db_path().map_err(CoordinatorError::Config)?)
            .map_err(CoordinatorError::Storage)?;
        let listener = TcpListener::bind(config.bind_addr())?;
        Ok(Self::with_registry(listener, Arc::new(Registry::new(db))))
    }

    pub fn with_registry(listener: TcpListener, registry: Arc<Registry>) -> Self {
        Self {
            listener,
            registry,
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CoordinatorError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts clients until the listener fails.
    pub fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Coordinator listening");
        }
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
                    let registry = Arc::clone(&self.registry);
                    let spawned = thread::Builder::new()
                        .name(format!("conn-{}", id))
                        .spawn(move || handle_connection(stream, id, registry));
                    if let Err(err) = spawned {
                        warn!(error = %err, "Failed to spawn connection thread");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Failed to accept client connection");
                }
            }
        }
    }

    /// Runs the accept loop on a background thread and returns the bound
    /// address.
    pub fn spawn(self) -> Result<SocketAddr, CoordinatorError> {
        let addr = self.local_addr()?;
        thread::Builder::new()
            .name("coordinator-accept".to_string())
            .spawn(move || self.run())?;
        Ok(addr)
    }
}
