//! Outbound half of the bridge's websocket.
//!
//! The bridge never inspects transport state enums; the transport reports
//! liveness through an explicit `is_open()`. A failed write latches the
//! socket closed so subsequent sends buffer instead of retrying a dead pipe.

use async_trait::async_trait;
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;

#[derive(thiserror::Error, Debug)]
#[error("socket write failed: {0}")]
pub struct SocketError(pub String);

#[async_trait]
pub trait EventSocket: Send {
    fn is_open(&self) -> bool;
    async fn send_text(&mut self, text: String) -> Result<(), SocketError>;
}

pub struct BridgeSocket {
    sink: WsSink,
    open: bool,
}

impl BridgeSocket {
    pub fn new(sink: WsSink) -> Self {
        Self { sink, open: true }
    }
}

#[async_trait]
impl EventSocket for BridgeSocket {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn send_text(&mut self, text: String) -> Result<(), SocketError> {
        match self.sink.send(Message::Text(text.into())).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.open = false;
                Err(SocketError(e.to_string()))
            }
        }
    }
}
