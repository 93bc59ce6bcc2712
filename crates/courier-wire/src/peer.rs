//! TCP server and client for the courier wire transport.
//!
//! A [`WireNode`] binds a local TCP listener and accepts connections from
//! other nodes, and it can connect outward as well. Each connection starts
//! with a hello exchange that carries the node ID, role and protocol version
//! of both ends. After that, a read loop per connection hands inbound
//! requests to the attached [`InboundHook`] and routes responses back to the
//! [`ReplySink`] of the call that is waiting for them.
//!
//! Writes go through a per-connection outbox drained by a single writer task,
//! so replies produced by concurrent handlers never interleave on the socket.
//! Frames are encoded and size-checked before they are queued, so a frame
//! that can never be sent fails its call instead of vanishing in the writer.
//!
//! A body that arrives intact but does not decode is skipped; the length
//! prefix keeps the stream aligned and other calls on the link carry on.

use crate::message::{decode_frame, decode_length, encode_frame, WireFrame, MAX_FRAME_SIZE};
use crate::registry::{PeerState, WirePeer, WireRegistry};
use courier_bus::{InboundHook, Peer, ReplySink, Transport, TransportError};
use courier_types::{Envelope, Role, TargetContext, PROTOCOL_VERSION};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Errors from the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
}

/// Configuration for a WireNode.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// This node's unique ID. Remote nodes address it as a target context.
    pub node_id: String,
    /// Role this node plays on the bus.
    pub role: Role,
    /// Protocol version announced in the handshake.
    pub protocol_version: u32,
    /// How long an accepted connection may take to send its hello.
    pub handshake_timeout_ms: u64,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            node_id: uuid::Uuid::new_v4().to_string(),
            role: Role::Background,
            protocol_version: PROTOCOL_VERSION,
            handshake_timeout_ms: 10_000,
        }
    }
}

#[derive(Clone)]
struct Link {
    /// Encoded frames, already checked against `MAX_FRAME_SIZE`.
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: Arc<Notify>,
}

#[derive(Clone)]
struct Outstanding {
    node_id: String,
    reply: ReplySink,
}

/// A network endpoint of the bus.
pub struct WireNode {
    config: WireConfig,
    registry: WireRegistry,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    links: DashMap<String, Link>,
    /// Requests this node sent that still expect a reply, by call ID.
    outstanding: DashMap<String, Outstanding>,
    inbound: RwLock<Option<Arc<dyn InboundHook>>>,
}

impl WireNode {
    /// Create and start listening on the configured address.
    pub async fn start(config: WireConfig) -> Result<(Arc<Self>, JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            node_id = %config.node_id,
            role = %config.role,
            "Wire node listening"
        );

        let node = Arc::new(Self {
            config,
            registry: WireRegistry::new(),
            local_addr,
            links: DashMap::new(),
            outstanding: DashMap::new(),
            inbound: RwLock::new(None),
        });

        let node_clone = Arc::clone(&node);
        let accept_handle = tokio::spawn(async move {
            node_clone.accept_loop(listener).await;
        });

        Ok((node, accept_handle))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This node's ID.
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Role this node announces to its peers.
    pub fn role(&self) -> &Role {
        &self.config.role
    }

    /// Known remote nodes.
    pub fn registry(&self) -> &WireRegistry {
        &self.registry
    }

    /// Number of sent requests still waiting for a reply.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Connect to a remote node and perform the hello exchange.
    ///
    /// Returns the remote node's ID. The connection is usable for delivery as
    /// soon as this returns.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<String, WireError> {
        info!(%addr, "Connecting to wire peer");
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = stream.into_split();

        let hello = WireFrame::Hello {
            node_id: self.config.node_id.clone(),
            role: self.config.role.clone(),
            protocol_version: self.config.protocol_version,
        };
        write_frame(&mut writer, &hello).await?;

        let peer = match read_frame(&mut reader).await? {
            WireFrame::HelloAck {
                node_id,
                role,
                protocol_version,
            } => {
                if protocol_version != self.config.protocol_version {
                    return Err(WireError::VersionMismatch {
                        local: self.config.protocol_version,
                        remote: protocol_version,
                    });
                }
                WirePeer {
                    node_id,
                    role,
                    address: addr,
                    state: PeerState::Connected,
                    connected_at: chrono::Utc::now(),
                    protocol_version,
                }
            }
            WireFrame::Rejected { message } => return Err(WireError::HandshakeFailed(message)),
            other => {
                return Err(WireError::HandshakeFailed(format!(
                    "Unexpected response to hello: {other:?}"
                )));
            }
        };

        info!(peer = %peer.node_id, role = %peer.role, %addr, "Wire handshake complete");
        let node_id = peer.node_id.clone();
        self.registry.add_peer(peer);

        let link = self.open_link(&node_id, writer);
        tokio::spawn(Arc::clone(self).run_link(reader, node_id.clone(), link));
        Ok(node_id)
    }

    /// Close the connection to `node_id`. Calls waiting on it fail with
    /// [`TransportError::Disconnected`].
    pub fn disconnect(&self, node_id: &str) -> bool {
        match self.links.get(node_id) {
            Some(link) => {
                link.shutdown.notify_one();
                true
            }
            None => false,
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "Accepted wire connection");
                    let node = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = node.handle_inbound(stream, addr).await {
                            debug!(%addr, error = %e, "Inbound wire connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Wire accept error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Handshake an accepted connection, then serve it until it closes.
    async fn handle_inbound(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), WireError> {
        let (mut reader, mut writer) = stream.into_split();

        let wait = Duration::from_millis(self.config.handshake_timeout_ms);
        let Ok(first) = tokio::time::timeout(wait, read_frame(&mut reader)).await else {
            warn!(
                %addr,
                timeout_ms = self.config.handshake_timeout_ms,
                "No hello from wire connection"
            );
            let rejected = WireFrame::Rejected {
                message: "Handshake timed out waiting for hello".to_string(),
            };
            write_frame(&mut writer, &rejected).await?;
            return Err(WireError::HandshakeFailed("Timed out waiting for hello".into()));
        };

        let peer = match first? {
            WireFrame::Hello {
                node_id,
                role,
                protocol_version,
            } => {
                if protocol_version != self.config.protocol_version {
                    let rejected = WireFrame::Rejected {
                        message: format!(
                            "Protocol version mismatch: expected {}, got {}",
                            self.config.protocol_version, protocol_version
                        ),
                    };
                    write_frame(&mut writer, &rejected).await?;
                    return Err(WireError::VersionMismatch {
                        local: self.config.protocol_version,
                        remote: protocol_version,
                    });
                }
                WirePeer {
                    node_id,
                    role,
                    address: addr,
                    state: PeerState::Connected,
                    connected_at: chrono::Utc::now(),
                    protocol_version,
                }
            }
            other => {
                warn!(%addr, frame = ?other, "Rejected wire connection without hello");
                let rejected = WireFrame::Rejected {
                    message: "Handshake required: send hello first".to_string(),
                };
                write_frame(&mut writer, &rejected).await?;
                return Err(WireError::HandshakeFailed(
                    "Connection opened without hello".into(),
                ));
            }
        };

        let ack = WireFrame::HelloAck {
            node_id: self.config.node_id.clone(),
            role: self.config.role.clone(),
            protocol_version: self.config.protocol_version,
        };
        write_frame(&mut writer, &ack).await?;

        info!(peer = %peer.node_id, role = %peer.role, %addr, "Wire handshake accepted");
        let node_id = peer.node_id.clone();
        self.registry.add_peer(peer);

        let link = self.open_link(&node_id, writer);
        self.run_link(reader, node_id, link).await;
        Ok(())
    }

    /// Register the outbox for `node_id` and spawn its writer task.
    fn open_link(&self, node_id: &str, mut writer: OwnedWriteHalf) -> (Link, JoinHandle<()>) {
        let (outbox, mut frames) = mpsc::unbounded_channel::<Vec<u8>>();
        let peer = node_id.to_string();
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = frames.recv().await {
                if let Err(e) = write_bytes(&mut writer, &bytes).await {
                    debug!(peer = %peer, error = %e, "Wire writer stopped");
                    break;
                }
            }
        });

        let link = Link {
            outbox,
            shutdown: Arc::new(Notify::new()),
        };
        if let Some(previous) = self.links.insert(node_id.to_string(), link.clone()) {
            debug!(peer = %node_id, "Replacing existing wire connection");
            previous.shutdown.notify_one();
        }
        (link, writer_task)
    }

    /// Serve one established connection until it closes, then clean up.
    async fn run_link(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        node_id: String,
        (link, writer_task): (Link, JoinHandle<()>),
    ) {
        let outcome = tokio::select! {
            result = self.read_loop(&mut reader, &node_id, &link.outbox) => result,
            _ = link.shutdown.notified() => {
                debug!(peer = %node_id, "Wire connection closed locally");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            debug!(peer = %node_id, error = %e, "Wire connection ended");
        }
        writer_task.abort();

        // A replaced connection must not tear down its successor's state.
        let current = self
            .links
            .remove_if(&node_id, |_, l| l.outbox.same_channel(&link.outbox))
            .is_some();
        if current {
            self.registry.mark_disconnected(&node_id);
            self.fail_outstanding(&node_id);
            info!(peer = %node_id, "Wire peer disconnected");
        }
    }

    async fn read_loop<R>(
        &self,
        reader: &mut R,
        node_id: &str,
        outbox: &mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let body = match read_body(reader).await {
                Ok(body) => body,
                Err(WireError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            let frame = match decode_frame(&body) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(
                        peer = %node_id,
                        error = %e,
                        len = body.len(),
                        "Skipping undecodable frame"
                    );
                    self.reject_malformed(&body, node_id, outbox);
                    continue;
                }
            };

            match frame {
                WireFrame::Envelope { envelope } if envelope.is_request() => {
                    self.accept_request(envelope, node_id, outbox);
                }
                WireFrame::Envelope { envelope } => self.route_response(envelope, node_id),
                WireFrame::Closed { id } => {
                    if let Some((_, call)) = self.outstanding.remove(&id) {
                        call.reply.fail(TransportError::PortClosed);
                    }
                }
                other => warn!(peer = %node_id, frame = ?other, "Unexpected frame after handshake"),
            }
        }
    }

    /// Settle whichever call an undecodable envelope frame belonged to.
    ///
    /// A reply to one of our calls fails that call; anything else is treated
    /// as a request and the sender is told it will not be answered.
    fn reject_malformed(
        &self,
        body: &[u8],
        node_id: &str,
        outbox: &mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let Some(id) = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("envelope")?.get("id")?.as_str().map(str::to_string))
        else {
            return;
        };
        if let Some((_, call)) = self.outstanding.remove(&id) {
            call.reply
                .fail(TransportError::Delivery(format!("Malformed reply from {node_id}")));
        } else {
            send_frame(outbox, &WireFrame::Closed { id });
        }
    }

    fn accept_request(
        &self,
        envelope: Envelope,
        node_id: &str,
        outbox: &mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let hook = self
            .inbound
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(hook) = hook else {
            debug!(
                peer = %node_id,
                call_id = %envelope.id,
                kind = %envelope.kind,
                "No inbound hook, request dropped"
            );
            return;
        };

        trace!(peer = %node_id, call_id = %envelope.id, kind = %envelope.kind, "Inbound request");
        let call_id = envelope.id.clone();
        let reply_outbox = outbox.clone();
        let reply_id = call_id.clone();
        let reply = ReplySink::new(call_id.clone(), move |r: Result<Envelope, TransportError>| {
            let closed = WireFrame::Closed {
                id: reply_id.clone(),
            };
            let envelope = match r {
                Ok(envelope) => envelope,
                Err(_) => {
                    send_frame(&reply_outbox, &closed);
                    return;
                }
            };
            let terminal = envelope.is_terminal();
            match encode_bounded(&WireFrame::Envelope { envelope }) {
                // The connection is gone if this fails; the caller learns that
                // from its own side of the socket.
                Ok(bytes) => {
                    let _ = reply_outbox.send(bytes);
                }
                Err(e) if terminal => {
                    warn!(call_id = %reply_id, error = %e, "Reply cannot be sent, closing port");
                    send_frame(&reply_outbox, &closed);
                }
                Err(e) => {
                    warn!(call_id = %reply_id, error = %e, "Dropping unsendable stream piece");
                }
            }
        });

        if !hook.on_message(envelope, reply) {
            send_frame(outbox, &WireFrame::Closed { id: call_id });
        }
    }

    fn route_response(&self, envelope: Envelope, node_id: &str) {
        let call = if envelope.is_terminal() {
            self.outstanding.remove(&envelope.id).map(|(_, call)| call)
        } else {
            self.outstanding.get(&envelope.id).map(|call| call.value().clone())
        };
        match call {
            Some(call) => call.reply.reply(envelope),
            None => debug!(
                peer = %node_id,
                call_id = %envelope.id,
                "Reply for unknown call dropped"
            ),
        }
    }

    fn fail_outstanding(&self, node_id: &str) {
        let ids: Vec<String> = self
            .outstanding
            .iter()
            .filter(|entry| entry.value().node_id == node_id)
            .map(|entry| entry.key().clone())
            .collect();
        if !ids.is_empty() {
            warn!(peer = %node_id, count = ids.len(), "Failing calls on lost connection");
        }
        for id in ids {
            if let Some((_, call)) = self.outstanding.remove(&id) {
                call.reply
                    .fail(TransportError::Disconnected(node_id.to_string()));
            }
        }
    }

    /// Pick the connected node an envelope is addressed to.
    fn select_peer(&self, envelope: &Envelope) -> Option<String> {
        self.registry
            .find_by_role(&envelope.to)
            .into_iter()
            .find(|p| match &envelope.target_context {
                None => true,
                Some(TargetContext::Name(name)) => p.node_id == *name,
                Some(TargetContext::Id(id)) => p.node_id == id.to_string(),
            })
            .map(|p| p.node_id)
    }
}

impl Transport for WireNode {
    fn deliver(&self, envelope: Envelope, reply: ReplySink) -> Result<(), TransportError> {
        let destination = Peer::new(envelope.to.clone(), envelope.target_context.clone());
        let outbox = self
            .select_peer(&envelope)
            .and_then(|node_id| {
                self.links
                    .get(&node_id)
                    .map(|link| (node_id, link.outbox.clone()))
            });
        let Some((node_id, outbox)) = outbox else {
            return Err(TransportError::NoListener(destination.to_string()));
        };

        trace!(call_id = %envelope.id, kind = %envelope.kind, peer = %node_id, "Wire delivery");
        let call_id = envelope.id.clone();
        let bytes = encode_bounded(&WireFrame::Envelope { envelope }).map_err(|e| {
            warn!(call_id = %call_id, peer = %node_id, error = %e, "Request cannot be sent");
            TransportError::Delivery(e.to_string())
        })?;
        self.outstanding.insert(
            call_id.clone(),
            Outstanding {
                node_id: node_id.clone(),
                reply,
            },
        );
        if outbox.send(bytes).is_err() {
            self.outstanding.remove(&call_id);
            return Err(TransportError::Disconnected(node_id));
        }
        Ok(())
    }

    fn set_inbound(&self, hook: Arc<dyn InboundHook>) {
        let mut inbound = self.inbound.write().unwrap_or_else(|e| e.into_inner());
        *inbound = Some(hook);
    }

    fn peers(&self) -> Vec<Peer> {
        self.registry
            .connected_peers()
            .into_iter()
            .map(|p| Peer::new(p.role, Some(TargetContext::Name(p.node_id))))
            .collect()
    }

    fn release(&self, call_id: &str) {
        self.outstanding.remove(call_id);
    }
}

/// Encode a frame, refusing bodies over [`MAX_FRAME_SIZE`].
fn encode_bounded(frame: &WireFrame) -> Result<Vec<u8>, WireError> {
    let bytes = encode_frame(frame)?;
    let body_len = bytes.len() - 4;
    if body_len > MAX_FRAME_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: u32::try_from(body_len).unwrap_or(u32::MAX),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Queue a small control frame on a connection outbox.
fn send_frame(outbox: &mpsc::UnboundedSender<Vec<u8>>, frame: &WireFrame) {
    match encode_bounded(frame) {
        Ok(bytes) => {
            let _ = outbox.send(bytes);
        }
        Err(e) => warn!(error = %e, "Failed to encode control frame"),
    }
}

async fn write_bytes<W>(writer: &mut W, bytes: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_frame<W>(writer: &mut W, frame: &WireFrame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_bounded(frame)?;
    write_bytes(writer, &bytes).await
}

/// Read a framed message (4-byte length + JSON).
pub async fn read_frame<R>(reader: &mut R) -> Result<WireFrame, WireError>
where
    R: AsyncRead + Unpin,
{
    let body = read_body(reader).await?;
    Ok(decode_frame(&body)?)
}

/// Read one length-prefixed body without decoding it.
///
/// Errors here mean the stream itself is unusable; a body that fails to
/// decode afterwards leaves the stream aligned on the next frame.
async fn read_body<R>(reader: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
