use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config;
use crate::peers::PeerChannel;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
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
    TlsNotSupported,
    ConfigureStream {
        source: io::Error,
    },
    StreamClone {
        source: io::Error,
    },
    Resolve {
        address: String,
        source: io::Error,
    },
    Connect {
        address: String,
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
            Self::TlsNotSupported => {
                write!(f, "TLS is enabled in config but TLS transport is not available")
            }
            Self::ConfigureStream { source } => {
                write!(f, "failed to configure TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone TCP stream for full duplex IO: {source}")
            }
            Self::Resolve { address, source } => {
                write!(f, "failed to resolve '{address}': {source}")
            }
            Self::Connect { address, source } => {
                write!(f, "failed to connect to {address}: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

/// Non-blocking TCP stream with separately locked read and write halves.
pub struct PersistentConnection {
    id: u64,
    peer_addr: SocketAddr,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

impl PersistentConnection {
    fn new(id: u64, stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| ServerError::ConfigureStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        Ok(Self {
            id,
            peer_addr,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
        })
    }

    /// Resolves `host:port` and connects to the first address that answers.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ServerError> {
        let address = format!("{host}:{port}");
        let candidates = address
            .to_socket_addrs()
            .map_err(|source| ServerError::Resolve {
                address: address.clone(),
                source,
            })?;

        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => return Self::new(0, stream, candidate),
                Err(error) => last_error = error,
            }
        }

        Err(ServerError::Connect {
            address,
            source: last_error,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl PeerChannel for PersistentConnection {
    fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.reader
            .lock()
            .expect("connection reader lock poisoned")
            .read(buffer)
    }

    fn try_write(&self, payload: &[u8]) -> io::Result<usize> {
        self.writer
            .lock()
            .expect("connection writer lock poisoned")
            .write(payload)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.writer
            .lock()
            .expect("connection writer lock poisoned")
            .shutdown(Shutdown::Both)
    }

    fn remote_addr(&self) -> String {
        self.peer_addr.to_string()
    }
}

pub struct TcpServer {
    listener: TcpListener,
    next_connection_id: AtomicU64,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        if config.tls_enabled {
            return Err(ServerError::TlsNotSupported);
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
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        Self::bind(&ServerConfig::from(app_config.server.clone()))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one pending connection, if any. Failures to configure a single
    /// accepted stream are reported without affecting the listener.
    pub fn try_accept_persistent(&self) -> Result<Option<PersistentConnection>, ServerError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                PersistentConnection::new(id, stream, peer_addr).map(Some)
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(ServerError::ConfigureStream { source }),
        }
    }
}
