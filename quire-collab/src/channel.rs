//! Duplex, message-oriented transports between a client and a room.
//!
//! A [`Channel`] carries opaque binary frames. `recv` resolves to `None`
//! once the peer has gone away, which is how a room learns that a session
//! ended.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

/// Transport errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer disconnected.
    #[error("channel closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    async fn send(&self, message: Vec<u8>) -> Result<(), ChannelError>;

    /// Wait for the next frame; `None` when the peer disconnected.
    async fn recv(&self) -> Option<Vec<u8>>;
}

/// In-process channel end, backed by a pair of tokio mpsc queues.
pub struct MemoryChannel {
    id: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryChannel {
    /// Two connected ends. Dropping one end terminates `recv` on the other.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4().simple().to_string();
        (
            Self {
                id: format!("{id}:a"),
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Self {
                id: format!("{id}:b"),
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: Vec<u8>) -> Result<(), ChannelError> {
        self.tx.send(message).map_err(|_| ChannelError::Closed)
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }
}

/// WebSocket channel. Binary frames are messages; text, ping and pong frames
/// are skipped, and a close frame or transport error ends the stream.
pub struct WsChannel<S> {
    id: String,
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(id: impl Into<String>, socket: WebSocketStream<S>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            id: id.into(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }

    /// Send a close frame; errors are ignored since the peer may be gone.
    pub async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

#[async_trait]
impl<S> Channel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: Vec<u8>) -> Result<(), ChannelError> {
        self.sink
            .lock()
            .await
            .send(WsMessage::Binary(message.into()))
            .await?;
        Ok(())
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Some(data.into()),
                Some(Ok(WsMessage::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    log::debug!("WebSocket error on {}: {e}", self.id);
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_is_duplex() {
        let (a, b) = MemoryChannel::pair();
        a.send(vec![1, 2]).await.unwrap();
        b.send(vec![3]).await.unwrap();
        assert_eq!(b.recv().await, Some(vec![1, 2]));
        assert_eq!(a.recv().await, Some(vec![3]));
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_recv_ends_when_peer_drops() {
        let (a, b) = MemoryChannel::pair();
        a.send(vec![9]).await.unwrap();
        drop(a);
        assert_eq!(b.recv().await, Some(vec![9]));
        assert_eq!(b.recv().await, None);
        assert!(matches!(b.send(vec![1]).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_websocket_channel_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let channel = WsChannel::new("server", ws);
            let frame = channel.recv().await.unwrap();
            channel.send(frame).await.unwrap();
            channel.recv().await
        });

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let client = WsChannel::new("client", ws);
        client.send(vec![4, 5, 6]).await.unwrap();
        assert_eq!(client.recv().await, Some(vec![4, 5, 6]));
        client.close().await;

        assert_eq!(server.await.unwrap(), None);
    }
}
