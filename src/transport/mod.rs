//! Transport Layer
//!
//! Responsibilities:
//! - Establish lowest-level connections (TCP)
//! - NO encryption, NO framing, NO content inspection
//!
//! The connector dials CONNECT targets through an injected
//! `Arc<dyn Transport>`, so tests can substitute refusing or in-memory
//! transports for real sockets.

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::common::{Address, Error, Result, Stream};

/// Transport trait for establishing raw connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote address
    async fn connect(&self, addr: &Address) -> Result<Stream>;

    /// Create a listener bound to an address
    async fn bind(&self, addr: &Address) -> Result<Box<dyn Listener>>;
}

/// Listener trait for accepting incoming connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept a new connection
    async fn accept(&self) -> Result<(Stream, Address)>;

    /// Get the local bound address
    fn local_addr(&self) -> Result<Address>;
}

/// Plain TCP, the only transport real deployments use.
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &Address) -> Result<Stream> {
        // Domain targets resolve here; CONNECT clients routinely send names.
        let stream = TcpStream::connect(addr.to_string()).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn bind(&self, addr: &Address) -> Result<Box<dyn Listener>> {
        let Address::Socket(addr) = addr else {
            return Err(Error::Config(format!(
                "listen address must be ip:port, got {}",
                addr
            )));
        };
        let acceptor = TcpAcceptor(TcpListener::bind(addr).await?);
        Ok(Box::new(acceptor))
    }
}

struct TcpAcceptor(TcpListener);

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> Result<(Stream, Address)> {
        let (stream, peer) = self.0.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), peer.into()))
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(self.0.local_addr()?.into())
    }
}
