//! WebSocket transport over TCP.
//!
//! The listener accepts plain TCP; the WebSocket upgrade runs inside the
//! per-connection task so a slow handshake never stalls the accept loop.
//! Each client message travels in one text frame.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;

use crate::error::ServerError;

/// WebSocket stream over an accepted TCP connection.
pub type WsStream = WebSocketStream<TcpStream>;

/// TCP listener that hands out connections for WebSocket upgrade.
#[derive(Debug)]
pub struct WsTransport {
    listener: TcpListener,
}

impl WsTransport {
    /// Bind the listener.
    ///
    /// An address that does not parse is a configuration error; failing to
    /// bind a valid address is a transport error.
    pub async fn bind(address: &str) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;

        tracing::info!("WebSocket transport bound to {}", addr);

        Ok(Self { listener })
    }

    /// Accept the next TCP connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        self.listener
            .accept()
            .await
            .map_err(|e| ServerError::Transport(format!("accept failed: {e}")))
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }
}

/// Perform the server side of the WebSocket handshake.
pub async fn upgrade(stream: TcpStream) -> Result<WsStream, ServerError> {
    tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| ServerError::Transport(format!("websocket handshake failed: {e}")))
}
