use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::protocol::error::{Result, RpcError};
use crate::transport::MessageChannel;

/// Connects to a WebSocket endpoint (`ws://host:port/...`).
///
/// The returned channel stays usable until either side closes the socket.
pub async fn connect(url: &str) -> Result<MessageChannel> {
    let (ws, _response) = connect_async(url)
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to connect to {}: {}", url, e)))?;

    info!("WebSocket connected to {}", url);
    Ok(spawn_pumps(ws, url.to_string()))
}

/// Completes the server side WebSocket handshake on an accepted TCP stream.
pub async fn accept(stream: TcpStream) -> Result<MessageChannel> {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown peer".to_string());

    let ws = accept_async(stream)
        .await
        .map_err(|e| RpcError::Transport(format!("WebSocket handshake with {} failed: {}", peer, e)))?;

    Ok(spawn_pumps(ws, peer))
}

/// Moves frames between the socket and a [`MessageChannel`].
///
/// One task drains the outbound queue into the socket, another forwards text
/// frames to the inbound queue. The inbound queue ends when the socket closes
/// or errors.
fn spawn_pumps<S>(ws: WebSocketStream<S>, peer: String) -> MessageChannel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

    let writer_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                warn!("Failed to send frame to {}: {}", writer_peer, e);
                break;
            }
        }
        let _ = sink.close().await;
        debug!("Writer for {} stopped", writer_peer);
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Dropping non UTF-8 binary frame from {}", peer);
                        continue;
                    }
                },
                Ok(Message::Close(_)) => break,
                // ping/pong are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => {
                    debug!("Connection to {} failed: {}", peer, e);
                    break;
                }
            };
            if in_tx.send(text).is_err() {
                break;
            }
        }
        info!("Connection to {} closed", peer);
    });

    MessageChannel::new(out_tx, in_rx)
}

/// WebSocket listener.
///
/// Accepts connections in a loop and spawns a task per connection, handing
/// the handler a ready [`MessageChannel`].
pub struct WsServer {
    listener: TcpListener,
}

impl WsServer {
    /// Creates a new WebSocket server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:9000")
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| RpcError::Transport(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Transport(format!("Failed to get local addr: {}", e)))
    }

    /// Runs the accept loop.
    ///
    /// Handshake failures are logged and do not stop the loop; only a failing
    /// listener does.
    pub async fn run<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(MessageChannel, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| RpcError::Transport(format!("Failed to accept connection: {}", e)))?;

            debug!("TCP connection from {}", peer_addr);

            let handler = handler.clone();
            tokio::spawn(async move {
                match accept(stream).await {
                    Ok(channel) => handler(channel, peer_addr).await,
                    Err(e) => warn!("{}", e),
                }
            });
        }
    }
}
