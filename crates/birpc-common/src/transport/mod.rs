//! birpc Transport Layer
//!
//! The RPC engine never touches sockets. It consumes a whole-message duplex
//! channel: something it can hand outbound text to ([`Transmit`]), a stream
//! of inbound text, and the end of that stream as the close signal.
//!
//! # Components
//!
//! - **[`Transmit`]**: outbound half, implemented for tokio mpsc senders
//! - **[`MessageChannel`]**: an outbound sender plus an inbound receiver
//! - **[`MessageChannel::pair`]**: two connected in-memory channels (tests, in-process peers)
//! - **[`websocket`]**: adapters turning a WebSocket connection into a `MessageChannel`
//!
//! # Example
//!
//! ```
//! use birpc_common::transport::{MessageChannel, Transmit};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let (a, mut b) = MessageChannel::pair();
//! a.outbound.transmit("hello".to_string()).unwrap();
//! assert_eq!(b.inbound.recv().await.as_deref(), Some("hello"));
//! # });
//! ```

pub mod websocket;

use tokio::sync::mpsc;

use crate::protocol::error::{Result, RpcError};

pub use websocket::WsServer;

/// Outbound half of a message transport.
///
/// `transmit` must not block: it hands a complete message to the transport
/// and reports whether the transport accepted it. An error means the
/// connection is unusable.
pub trait Transmit: Send + Sync + 'static {
    fn transmit(&self, message: String) -> Result<()>;
}

impl Transmit for mpsc::UnboundedSender<String> {
    fn transmit(&self, message: String) -> Result<()> {
        self.send(message)
            .map_err(|_| RpcError::Transport("transport closed".to_string()))
    }
}

/// A whole-message duplex channel.
///
/// The inbound receiver yielding `None` means the transport closed.
#[derive(Debug)]
pub struct MessageChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

impl MessageChannel {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// Two channels wired back to back: what one transmits the other receives.
    ///
    /// Dropping either side closes the other's inbound stream.
    pub fn pair() -> (MessageChannel, MessageChannel) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MessageChannel::new(a_tx, a_rx),
            MessageChannel::new(b_tx, b_rx),
        )
    }
}
