//! Transport abstraction for persistent cloud connections.
//!
//! The connection manager never talks to a socket directly; it opens links
//! through the [`Transport`] trait. Production uses [`WsTransport`] over
//! tokio-tungstenite. Tests use [`MemoryTransport`], which records outbound
//! frames and lets the test inject inbound frames and closes.

use crate::error::{ConnectError, ConnectResult};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// An open bidirectional link.
#[async_trait]
pub trait TransportLink: Send {
    /// Write one text frame.
    async fn send(&mut self, text: String) -> ConnectResult<()>;

    /// Read the next text frame. `None` means the peer closed the link.
    async fn recv(&mut self) -> Option<ConnectResult<String>>;

    /// Send a keepalive ping.
    async fn ping(&mut self) -> ConnectResult<()>;

    /// Close the link.
    async fn close(&mut self) -> ConnectResult<()>;
}

/// Factory for opening links to an endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link. The caller applies the connect timeout.
    async fn open(&self, url: &Url) -> ConnectResult<Box<dyn TransportLink>>;
}

/// WebSocket transport over tokio-tungstenite.
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &Url) -> ConnectResult<Box<dyn TransportLink>> {
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl TransportLink for WsLink {
    async fn send(&mut self, text: String) -> ConnectResult<()> {
        self.stream
            .send(Message::text(text))
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<ConnectResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => return None,
                // Pongs and binary frames are not part of the protocol
                Ok(_) => continue,
                Err(e) => return Some(Err(ConnectError::Transport(e.to_string()))),
            }
        }
    }

    async fn ping(&mut self) -> ConnectResult<()> {
        self.stream
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> ConnectResult<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))
    }
}

/// Scripted in-memory transport for tests.
///
/// Every `open` call produces a link wired to the shared state: frames the
/// manager writes land in `sent`, and the test pushes inbound frames with
/// [`MemoryTransport::inject`]. `fail_next_opens` makes the next N opens
/// fail, for reconnect tests.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    sent: Vec<String>,
    pings: usize,
    opens: usize,
    fail_next_opens: usize,
    inbound_tx: Option<mpsc::UnboundedSender<String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` open calls fail.
    pub async fn fail_next_opens(&self, n: usize) {
        self.state.lock().await.fail_next_opens = n;
    }

    /// Frames written by the manager so far.
    pub async fn sent(&self) -> Vec<String> {
        self.state.lock().await.sent.clone()
    }

    /// Number of successful open calls.
    pub async fn open_count(&self) -> usize {
        self.state.lock().await.opens
    }

    /// Number of pings the manager has sent.
    pub async fn ping_count(&self) -> usize {
        self.state.lock().await.pings
    }

    /// Push an inbound frame to the most recently opened link.
    pub async fn inject(&self, text: impl Into<String>) {
        let state = self.state.lock().await;
        if let Some(tx) = &state.inbound_tx {
            let _ = tx.send(text.into());
        }
    }

    /// Close the most recently opened link from the peer side.
    pub async fn close_peer(&self) {
        self.state.lock().await.inbound_tx = None;
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, _url: &Url) -> ConnectResult<Box<dyn TransportLink>> {
        let mut state = self.state.lock().await;
        if state.fail_next_opens > 0 {
            state.fail_next_opens -= 1;
            return Err(ConnectError::Transport("scripted open failure".to_string()));
        }
        state.opens += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.inbound_tx = Some(tx);
        Ok(Box::new(MemoryLink {
            state: self.state.clone(),
            inbound: rx,
        }))
    }
}

struct MemoryLink {
    state: Arc<Mutex<MemoryState>>,
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl TransportLink for MemoryLink {
    async fn send(&mut self, text: String) -> ConnectResult<()> {
        self.state.lock().await.sent.push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<ConnectResult<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn ping(&mut self) -> ConnectResult<()> {
        self.state.lock().await.pings += 1;
        Ok(())
    }

    async fn close(&mut self) -> ConnectResult<()> {
        self.inbound.close();
        Ok(())
    }
}
