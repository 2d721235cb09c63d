//! TCP listener for accepting terminal connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::net::TcpListener;

use crate::database::DatabaseHandle;
use crate::registry::DeviceRegistry;
use crate::server::session::Session;

/// Per-session timing configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Close a connection after this long without any traffic.
    pub idle_timeout: Duration,
    /// Minimum interval between accepted location reports per device.
    pub dedup_window: Duration,
    /// Upper bound on a single fire-and-forget database write.
    pub store_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            dedup_window: Duration::from_secs(10),
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Session timeouts.
    pub session: SessionConfig,
    /// Database handle.
    pub database: DatabaseHandle,
}

/// The main server that listens for terminal connections and spawns
/// one session task per connection.
pub struct Server {
    config: ServerConfig,
    registry: Arc<DeviceRegistry>,
    database: DatabaseHandle,
}

impl Server {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig, registry: Arc<DeviceRegistry>) -> Self {
        let database = config.database.clone();
        Self {
            config,
            registry,
            database,
        }
    }

    /// Run the server, accepting connections until shutdown.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("Terminal endpoint listening on {}", self.config.listen_addr);

        let mut connection_count = 0u64;

        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    connection_count += 1;
                    let session_id = connection_count;

                    info!("[Session {}] New connection from {}", session_id, addr);

                    let registry = Arc::clone(&self.registry);
                    let database = Arc::clone(&self.database);
                    let session_config = self.config.session.clone();

                    tokio::spawn(async move {
                        if let Err(e) = socket.set_nodelay(true) {
                            error!("[Session {}] Failed to set TCP_NODELAY: {}", session_id, e);
                        }
                        let mut session = Session::new(
                            session_id,
                            addr,
                            socket,
                            registry,
                            database,
                            session_config,
                        );
                        if let Err(e) = session.run().await {
                            error!("[Session {}] Connection error: {}", session_id, e);
                        }
                        info!("[Session {}] Connection closed", session_id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
