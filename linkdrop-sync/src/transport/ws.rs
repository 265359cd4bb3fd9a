//! WebSocket signaling and data channels.
//!
//! Every replica listens on a TCP address and knows the URLs of the peers it
//! may dial. A dialer opens a WebSocket and sends a hello as its first text
//! frame:
//! ```text
//! {"peer": "<dialer id>"}
//! ```
//! After that, each binary frame is one sync message.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{ChannelEvent, DataChannel, PeerId, Signaling, SignalingEvent, TransportError};

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub peer_id: PeerId,
    /// Address to accept peers on. Port 0 picks a free port.
    pub listen: SocketAddr,
    /// Known peers and the `ws://` URL each one listens on.
    pub peers: HashMap<PeerId, String>,
    pub connect_timeout: Duration,
}

impl WsConfig {
    pub fn new(peer_id: impl Into<PeerId>, listen: SocketAddr) -> Self {
        Self {
            peer_id: peer_id.into(),
            listen,
            peers: HashMap::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_peer(mut self, peer: impl Into<PeerId>, url: impl Into<String>) -> Self {
        self.peers.insert(peer.into(), url.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[derive(Serialize, Deserialize)]
struct Hello {
    peer: PeerId,
}

pub struct WsSignaling {
    config: WsConfig,
    directory: Mutex<HashMap<PeerId, String>>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    bound: Mutex<Option<SocketAddr>>,
}

impl WsSignaling {
    pub fn new(config: WsConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            directory: Mutex::new(config.peers.clone()),
            config,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            listener: Mutex::new(None),
            bound: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, once [`Signaling::acquire_id`] ran.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().ok().and_then(|addr| *addr)
    }

    /// Add or replace a dialable peer.
    pub fn add_peer(&self, peer: impl Into<PeerId>, url: impl Into<String>) {
        if let Ok(mut directory) = self.directory.lock() {
            directory.insert(peer.into(), url.into());
        }
    }

    async fn listen(&self) -> Result<(), TransportError> {
        // Rebind to the port we got the first time, so peers keep a valid URL.
        let addr = self.local_addr().unwrap_or(self.config.listen);
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        log::info!("Listening for peers on ws://{local}");

        let task = tokio::spawn(accept_loop(
            listener,
            self.events_tx.clone(),
            self.config.connect_timeout,
        ));
        if let Ok(mut bound) = self.bound.lock() {
            *bound = Some(local);
        }
        if let Ok(mut slot) = self.listener.lock() {
            if let Some(old) = slot.replace(task) {
                old.abort();
            }
        }
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .ok()
            .is_some_and(|slot| slot.as_ref().is_some_and(|task| !task.is_finished()))
    }
}

impl Signaling for WsSignaling {
    async fn acquire_id(&self) -> Result<PeerId, TransportError> {
        self.listen().await?;
        Ok(self.config.peer_id.clone())
    }

    async fn connect(&self, peer: PeerId) -> Result<DataChannel, TransportError> {
        let url = self
            .directory
            .lock()
            .ok()
            .and_then(|directory| directory.get(&peer).cloned())
            .ok_or_else(|| TransportError::PeerUnavailable(peer.clone()))?;

        let (mut ws, _) =
            tokio::time::timeout(self.config.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| TransportError::PeerUnavailable(peer.clone()))?
                .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        let hello = serde_json::to_string(&Hello {
            peer: self.config.peer_id.clone(),
        })
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
        ws.send(Message::Text(hello.into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        let (near, far) = DataChannel::pair();
        tokio::spawn(pump(ws, far));
        log::debug!("Dialed {peer} at {url}");
        Ok(near)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.is_listening() {
            return Ok(());
        }
        self.listen().await
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    fn release(&self) {
        if let Some(task) = self.listener.lock().ok().and_then(|mut slot| slot.take()) {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<SignalingEvent>,
    handshake_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let events = events.clone();
                tokio::spawn(async move {
                    let accepted =
                        tokio::time::timeout(handshake_timeout, accept_peer(stream, events)).await;
                    if let Err(e) = accepted.unwrap_or(Err(TransportError::Handshake(
                        "no hello before timeout".into(),
                    ))) {
                        log::debug!("Rejected connection from {addr}: {e}");
                    }
                });
            }
            Err(e) => {
                log::warn!("Peer listener failed: {e}");
                let _ = events.send(SignalingEvent::Disconnected);
                break;
            }
        }
    }
}

async fn accept_peer(
    stream: TcpStream,
    events: mpsc::UnboundedSender<SignalingEvent>,
) -> Result<(), TransportError> {
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    let hello: Hello = match ws.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str(text.as_str())
            .map_err(|e| TransportError::Handshake(e.to_string()))?,
        _ => return Err(TransportError::Handshake("expected hello frame".into())),
    };

    let (near, far) = DataChannel::pair();
    tokio::spawn(pump(ws, far));
    events
        .send(SignalingEvent::Offer {
            peer: hello.peer,
            channel: near,
        })
        .map_err(|_| TransportError::ChannelClosed)
}

/// Shuttle frames between a WebSocket and the far end of a channel pair.
async fn pump<S>(ws: WebSocketStream<S>, channel: DataChannel)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let DataChannel { sender, mut events } = channel;

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    if sender.send(data.to_vec()).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if sender.send(text.as_str().as_bytes().to_vec()).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    sender.close();
                    break;
                }
                Some(Err(e)) => {
                    log::debug!("WebSocket error: {e}");
                    sender.close();
                    break;
                }
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Some(ChannelEvent::Data(frame)) => {
                    if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                        log::debug!("WebSocket send failed: {e}");
                        sender.close();
                        break;
                    }
                }
                Some(ChannelEvent::Closed) | Some(ChannelEvent::Error(_)) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}
