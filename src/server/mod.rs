use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config;
use crate::registry::RegistryError;
use crate::session::handle::ConnectionCloser;
use crate::session::{ConnectionSession, SessionContext, SessionSummary};
use crate::wire::ConnectionId;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8112;
pub const DEFAULT_TLS_ENABLED: bool = false;
pub const DEFAULT_READ_POLL_INTERVAL_MS: u64 = 200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            tls_enabled: DEFAULT_TLS_ENABLED,
        }
    }
}

impl From<config::ServerConfig> for ServerConfig {
    fn from(value: config::ServerConfig) -> Self {
        Self {
            host: value.host,
            port: value.port,
            tls_enabled: value.tls_enabled,
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    TlsNotSupportedYet,
    Accept {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        connection_id: ConnectionId,
        source: io::Error,
    },
    StreamClone {
        connection_id: ConnectionId,
        source: io::Error,
    },
    Register(RegistryError),
    SpawnSessionThread {
        connection_id: ConnectionId,
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::TlsNotSupportedYet => {
                write!(f, "TLS is enabled in config but TLS transport is not implemented yet")
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
            Self::ConfigureAcceptedStream {
                connection_id,
                source,
            } => write!(
                f,
                "failed to configure accepted TCP stream for connection {connection_id}: {source}"
            ),
            Self::StreamClone {
                connection_id,
                source,
            } => write!(
                f,
                "failed to clone TCP stream for connection {connection_id}: {source}"
            ),
            Self::Register(source) => write!(f, "failed to open session: {source}"),
            Self::SpawnSessionThread {
                connection_id,
                source,
            } => write!(
                f,
                "failed to spawn session thread for connection {connection_id}: {source}"
            ),
        }
    }
}

impl std::error::Error for ServerError {}

/// Shuts the socket down so a blocked read on another clone returns.
pub struct StreamCloser {
    stream: TcpStream,
}

impl StreamCloser {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl ConnectionCloser for StreamCloser {
    fn close(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(error) if error.kind() != io::ErrorKind::NotConnected => Err(error),
            _ => Ok(()),
        }
    }
}

pub struct AcceptedConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    stream: TcpStream,
}

impl AcceptedConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Runs the connection's session on a dedicated thread.
    pub fn spawn_session(
        self,
        context: &SessionContext,
    ) -> Result<JoinHandle<SessionSummary>, ServerError> {
        let connection_id = self.id;
        let closer = self
            .stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone {
                connection_id,
                source,
            })?;

        let session = ConnectionSession::open(
            context,
            connection_id,
            self.peer_addr.to_string(),
            self.stream,
            Arc::new(StreamCloser::new(closer)),
        )
        .map_err(ServerError::Register)?;

        thread::Builder::new()
            .name(format!("hotcue-conn-{connection_id}"))
            .spawn(move || session.run())
            .map_err(|source| ServerError::SpawnSessionThread {
                connection_id,
                source,
            })
    }
}

/// Non-blocking TCP listener handing out blocking, read-timeout streams.
pub struct TcpServer {
    listener: TcpListener,
    next_connection_id: AtomicU64,
    read_poll_interval: Duration,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        if config.tls_enabled {
            return Err(ServerError::TlsNotSupportedYet);
        }

        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            next_connection_id: AtomicU64::new(1),
            read_poll_interval: Duration::from_millis(DEFAULT_READ_POLL_INTERVAL_MS),
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        let cfg = ServerConfig::from(app_config.server.clone());
        Ok(Self::bind(&cfg)?.with_read_poll_interval(Duration::from_millis(
            app_config.ingest.read_poll_interval_ms,
        )))
    }

    /// How long a session read may block before re-checking for drain.
    pub fn with_read_poll_interval(mut self, interval: Duration) -> Self {
        self.read_poll_interval = interval;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn try_accept(&self) -> Result<Option<AcceptedConnection>, ServerError> {
        let (stream, peer_addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(source) => return Err(ServerError::Accept { source }),
        };

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        configure_stream(&stream, self.read_poll_interval).map_err(|source| {
            ServerError::ConfigureAcceptedStream {
                connection_id: id,
                source,
            }
        })?;

        Ok(Some(AcceptedConnection {
            id,
            peer_addr,
            stream,
        }))
    }
}

fn configure_stream(stream: &TcpStream, read_poll_interval: Duration) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(read_poll_interval.max(Duration::from_millis(1))))
}
