//! TCP listener for accepting incoming peer connections.

use crate::Result;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Accepts incoming TCP connections on a port.
///
/// The listener hands back raw sockets; the overlay manager feeds them into
/// [`TcpPeer::accept`](crate::TcpPeer::accept) to wrap them as peers.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Binds to the specified port on all interfaces (0.0.0.0).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the port is already in use or binding fails.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "listening");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts the next incoming connection.
    pub async fn accept(&self) -> Result<TcpStream> {
        let (stream, remote_addr) = self.listener.accept().await?;
        debug!(%remote_addr, "accepted connection");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_ephemeral_and_accept() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.local_addr().port();
        assert_ne!(port, 0);

        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        assert_eq!(
            accepted.peer_addr().unwrap().port(),
            client.local_addr().unwrap().port()
        );
    }
}
