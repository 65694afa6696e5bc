//! TCP server and connection handling
//!
//! Accepts incoming peer connections, frames messages and runs the
//! handshake. Connection tasks only move frames: every decoded message is
//! forwarded to the node's dispatch channel.

use crate::network::message::{Message, NodeInfo, MAGIC};
use crate::network::peer::{PeerError, PeerHandle, PeerManager, PEER_QUEUE_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Frame header: magic (4) + payload length (4)
const HEADER_LEN: usize = 8;

/// Largest accepted payload
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Message codec for length-prefixed framing
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        if data.len() > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Frame of {} bytes exceeds limit", data.len()),
            ));
        }

        dst.reserve(HEADER_LEN + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            if src[..4] != MAGIC {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid magic bytes",
                ));
            }

            let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
            if len > MAX_FRAME_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Frame of {} bytes exceeds limit", len),
                ));
            }

            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            let data = src.split_to(len);

            // A well-framed but unparseable envelope is dropped; the stream stays usable.
            match Message::from_bytes(&data) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => log::warn!("Dropping malformed message: {}", e),
            }
        }
    }
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to `host:port`. Port 0 picks a free port.
    pub async fn bind(host: &str, port: u16) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }
}

/// Connect to a peer
pub async fn connect_to_peer(addr: &str) -> Result<(TcpStream, SocketAddr), PeerError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| PeerError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    let peer_addr = stream
        .peer_addr()
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

    Ok((stream, peer_addr))
}

/// Handle a peer connection (both inbound and outbound).
///
/// The dialing side opens with `HANDSHAKE`. On either side the first frame
/// received must be a handshake within `handshake_timeout`, otherwise the
/// connection is dropped before the peer is registered. The handshake frame
/// itself is forwarded so the node can answer and decide on sync.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    peer_manager: Arc<PeerManager>,
    local_info: NodeInfo,
    message_tx: mpsc::Sender<(SocketAddr, Message)>,
    outbound: bool,
    handshake_timeout: Duration,
) -> Result<(), PeerError> {
    let framed = Framed::new(stream, MessageCodec);
    let (mut writer, mut reader) = framed.split();

    if outbound {
        writer
            .send(Message::Handshake(local_info))
            .await
            .map_err(PeerError::IoError)?;
        log::debug!("Sent handshake to {}", addr);
    }

    let first = match tokio::time::timeout(handshake_timeout, reader.next()).await {
        Err(_) => {
            log::warn!("Handshake with {} timed out", addr);
            return Err(PeerError::HandshakeTimeout);
        }
        Ok(None) => return Err(PeerError::Disconnected),
        Ok(Some(Err(e))) => return Err(PeerError::IoError(e)),
        Ok(Some(Ok(msg))) => msg,
    };

    if first.node_info().is_none() {
        log::warn!(
            "Expected handshake from {}, got {}",
            addr,
            first.type_name()
        );
        return Err(PeerError::InvalidHandshake);
    }

    let (tx, mut rx) = mpsc::channel::<Message>(PEER_QUEUE_SIZE);
    peer_manager
        .add_peer(addr, PeerHandle { addr, tx }, outbound)
        .await?;

    let write_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = writer.send(msg).await {
                log::debug!("Write to {} failed: {}", addr, e);
                break;
            }
        }
    });

    if message_tx.send((addr, first)).await.is_ok() {
        loop {
            match reader.next().await {
                Some(Ok(msg)) => {
                    log::debug!("Received {} from {}", msg.type_name(), addr);
                    if message_tx.send((addr, msg)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", addr, e);
                    break;
                }
                None => {
                    log::info!("Peer {} disconnected", addr);
                    break;
                }
            }
        }
    }

    write_handle.abort();
    peer_manager.remove_peer(&addr).await;

    Ok(())
}
