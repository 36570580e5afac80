//! Connection factories: how the Agent dials out and the Relay listens,
//! over plain TCP or mutually-authenticated TLS.

use std::sync::Arc;

use async_trait::async_trait;
use portbridge_cert::{build_mutual_tls_client_config, build_mutual_tls_server_config, CertError, MutualTlsMaterial};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Boxed bidirectional stream, so Agent/Relay code stays transport-agnostic.
/// `Unpin` so it can be passed straight into `tokio::io::split` without an
/// extra pinning layer.
pub type BoxedStream = Box<dyn AsyncReadWrite + Send>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> AsyncReadWrite for T {}

#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error(transparent)]
    Cert(#[from] CertError),
}

/// One accepted or dialed connection ready for framing.
pub fn box_stream<S>(stream: S) -> BoxedStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Box::new(stream)
}

/// Mirrors the original's `ConnFactory`: one object knows how to both
/// dial out and listen on the same address/transport.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream, ConnectivityError>;
    async fn listen(&self) -> Result<Box<dyn Listener>, ConnectivityError>;
    fn address(&self) -> &str;
}

#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<BoxedStream, ConnectivityError>;
}

/// Plain TCP, no transport security. `network_type` (`tcp`/`tcp4`/`tcp6`)
/// is carried for parity with the original's dual-stack hint but does
/// not change Rust's resolution behavior, which always goes through the
/// OS resolver regardless.
pub struct TcpConnectionFactory {
    network_type: String,
    address: String,
}

impl TcpConnectionFactory {
    pub fn new(network_type: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network_type: network_type.into(),
            address: address.into(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(&self) -> Result<BoxedStream, ConnectivityError> {
        tracing::debug!(network_type = %self.network_type, address = %self.address, "dialing tcp");
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|source| ConnectivityError::Dial {
                address: self.address.clone(),
                source,
            })?;
        Ok(box_stream(stream))
    }

    async fn listen(&self) -> Result<Box<dyn Listener>, ConnectivityError> {
        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(|source| ConnectivityError::Bind {
                address: self.address.clone(),
                source,
            })?;
        Ok(Box::new(TcpListenerWrapper(listener)))
    }

    fn address(&self) -> &str {
        &self.address
    }
}

struct TcpListenerWrapper(TcpListener);

#[async_trait]
impl Listener for TcpListenerWrapper {
    async fn accept(&mut self) -> Result<BoxedStream, ConnectivityError> {
        let (stream, peer) = self.0.accept().await.map_err(ConnectivityError::Accept)?;
        tracing::debug!(%peer, "accepted tcp connection");
        Ok(box_stream(stream))
    }
}

/// Mutually-authenticated TLS over TCP. Both directions share the same
/// root CA and leaf certificate, matching `tlsFactory`'s single
/// `*tls.Config` used for both `Connect` and `Listen`. Setting
/// `require_client_cert` mirrors `onlyAllowRootCertSignedClients`:
/// when true, the listening side demands and verifies a client
/// certificate signed by the shared root.
pub struct TlsConnectionFactory {
    network_type: String,
    address: String,
    server_name: String,
    material: MutualTlsMaterial,
    require_client_cert: bool,
}

impl TlsConnectionFactory {
    pub fn new(
        network_type: impl Into<String>,
        address: impl Into<String>,
        server_name: impl Into<String>,
        material: MutualTlsMaterial,
        require_client_cert: bool,
    ) -> Self {
        Self {
            network_type: network_type.into(),
            address: address.into(),
            server_name: server_name.into(),
            material,
            require_client_cert,
        }
    }

    fn connector(&self) -> Result<TlsConnector, ConnectivityError> {
        let config = build_mutual_tls_client_config(&self.material)?;
        Ok(TlsConnector::from(Arc::new(config)))
    }

    fn acceptor(&self) -> Result<TlsAcceptor, ConnectivityError> {
        let config = if self.require_client_cert {
            build_mutual_tls_server_config(&self.material)?
        } else {
            portbridge_cert::ensure_crypto_provider();
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(
                    self.material.cert_chain.clone(),
                    portbridge_cert::load_private_key(&self.material.private_key_path)?,
                )
                .map_err(|e| ConnectivityError::Tls(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?
        };
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

#[async_trait]
impl ConnectionFactory for TlsConnectionFactory {
    async fn connect(&self) -> Result<BoxedStream, ConnectivityError> {
        tracing::debug!(network_type = %self.network_type, address = %self.address, "dialing tls");
        let tcp = TcpStream::connect(&self.address)
            .await
            .map_err(|source| ConnectivityError::Dial {
                address: self.address.clone(),
                source,
            })?;
        let name = rustls::pki_types::ServerName::try_from(self.server_name.clone())
            .map_err(|_| ConnectivityError::InvalidServerName(self.server_name.clone()))?;
        let connector = self.connector()?;
        let stream = connector
            .connect(name, tcp)
            .await
            .map_err(ConnectivityError::Tls)?;
        Ok(box_stream(stream))
    }

    async fn listen(&self) -> Result<Box<dyn Listener>, ConnectivityError> {
        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(|source| ConnectivityError::Bind {
                address: self.address.clone(),
                source,
            })?;
        let acceptor = self.acceptor()?;
        Ok(Box::new(TlsListenerWrapper { listener, acceptor }))
    }

    fn address(&self) -> &str {
        &self.address
    }
}

struct TlsListenerWrapper {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl Listener for TlsListenerWrapper {
    async fn accept(&mut self) -> Result<BoxedStream, ConnectivityError> {
        let (tcp, peer) = self.listener.accept().await.map_err(ConnectivityError::Accept)?;
        let stream = self
            .acceptor
            .accept(tcp)
            .await
            .map_err(ConnectivityError::Tls)?;
        tracing::debug!(%peer, "accepted tls connection");
        Ok(box_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tcp_factory_round_trips_a_connection() {
        let raw_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = raw_listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = raw_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
        });

        let factory = TcpConnectionFactory::new("tcp", addr.to_string());
        let mut stream = factory.connect().await.unwrap();
        stream.write_all(b"hello").await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_factory_listen_and_connect_pair_up() {
        let raw_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = raw_listener.local_addr().unwrap();
        drop(raw_listener);

        let dial_factory = TcpConnectionFactory::new("tcp", addr.to_string());
        let accept_factory = TcpConnectionFactory::new("tcp", addr.to_string());
        let mut listener = accept_factory.listen().await.unwrap();

        let accepted = tokio::spawn(async move { listener.accept().await });
        let mut client = dial_factory.connect().await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut server_side = accepted.await.unwrap().unwrap();
        let mut buf = [0u8; 4];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn invalid_server_name_is_rejected() {
        let result = rustls::pki_types::ServerName::try_from(String::from("not a valid name!"));
        assert!(result.is_err());
    }
}
