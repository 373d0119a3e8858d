//! Opening the duplex byte stream to the daemon.
//!
//! Local installs speak over the process's stdin/stdout. Remote installs
//! connect out over TCP and identify themselves with the install key before
//! the first frame. Reconnect attempts only apply while starting up; once a
//! session runs, losing the connection closes it. Serverless installs have no
//! duplex stream; they reach the daemon through [`crate::serverless`].

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config::{InstallMethod, RuntimeConfig};

pub const REMOTE_CONNECT_ATTEMPTS: u32 = 3;
pub const REMOTE_RETRY_DELAY: Duration = Duration::from_secs(5);

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("install method {0} has no duplex transport; use serverless::HttpInvoker")]
    Unsupported(InstallMethod),
    #[error("invalid daemon url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("could not build http client: {0}")]
    HttpClient(#[source] reqwest::Error),
    #[error("remote install needs REMOTE_INSTALL_KEY")]
    MissingKey,
    #[error("could not connect to {addr} after {attempts} attempt(s): {source}")]
    Connect {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Read and write halves of the connection, ready for `Session::start`.
pub struct Transport {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    peer: String,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("peer", &self.peer).finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(reader: BoxedReader, writer: BoxedWriter, peer: impl Into<String>) -> Self {
        Self {
            reader,
            writer,
            peer: peer.into(),
        }
    }

    /// Human readable description of the other end.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }

    pub fn stdio() -> Self {
        Self::new(Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()), "stdio")
    }
}

/// Open the transport matching the configured install method.
pub async fn open(config: &RuntimeConfig) -> Result<Transport, TransportError> {
    match config.install_method {
        InstallMethod::Local => Ok(Transport::stdio()),
        InstallMethod::Remote => {
            let key = config
                .remote_install_key
                .as_deref()
                .ok_or(TransportError::MissingKey)?;
            connect_remote(
                &config.remote_install_host,
                config.remote_install_port,
                key,
                REMOTE_CONNECT_ATTEMPTS,
                REMOTE_RETRY_DELAY,
            )
            .await
        }
        other => Err(TransportError::Unsupported(other)),
    }
}

/// Connect to a remote daemon and send the install key line.
pub async fn connect_remote(
    host: &str,
    port: u16,
    key: &str,
    attempts: u32,
    retry_delay: Duration,
) -> Result<Transport, TransportError> {
    let addr = format!("{host}:{port}");
    let attempts = attempts.max(1);
    let mut attempt = 0;

    let stream = loop {
        attempt += 1;
        match TcpStream::connect(&addr).await {
            Ok(stream) => break stream,
            Err(source) if attempt >= attempts => {
                return Err(TransportError::Connect {
                    addr,
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                warn!(%addr, attempt, error = %e, "connect to daemon failed, retrying");
                tokio::time::sleep(retry_delay).await;
            }
        }
    };
    let _ = stream.set_nodelay(true);

    let (reader, mut writer) = stream.into_split();
    let mut hello = String::with_capacity(key.len() + 1);
    hello.push_str(key);
    hello.push('\n');
    writer
        .write_all(hello.as_bytes())
        .await
        .map_err(|source| TransportError::Handshake {
            addr: addr.clone(),
            source,
        })?;

    info!(%addr, attempt, "connected to plugin daemon");
    Ok(Transport::new(Box::new(reader), Box::new(writer), addr))
}
