//! RawSocket WAMP transport.
//!
//! The wire format: a 4-octet handshake (`0x7F`, then `max_len << 4 |
//! serializer`, then two zero octets), followed by framed messages. Each
//! frame is a type octet (0 regular, 1 ping, 2 pong) plus a 24-bit
//! big-endian payload length. The serializer nibble is 1 for JSON and 3
//! for CBOR; unsupported values are answered with an error handshake
//! (`error_code << 4` in the second octet) and the connection is dropped.
//! There is no orderly close frame; either side just closes the socket.

use crate::unisocket::{PrefixedStream, StreamHandler};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wampd_core::{
    Serializer, SerializerRegistry, SessionFactory, TransportDetails, TransportHandle,
    TransportType, WampError, WampMessage, WampResult, WAMP_VERSION,
};

const MAGIC: u8 = 0x7F;

const MSG_REGULAR: u8 = 0;
const MSG_PING: u8 = 1;
const MSG_PONG: u8 = 2;

const ERR_SERIALIZER_UNSUPPORTED: u8 = 1;
const ERR_RESERVED_BITS: u8 = 3;

/// We advertise the largest allowed frame size: 2^(9 + 15) = 16 MiB.
const MAX_LENGTH_EXPONENT: u8 = 0xF;
const SERVER_MAX_LENGTH: usize = 1 << (9 + MAX_LENGTH_EXPONENT as u32);

enum Outbound {
    Message(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Outbound half handed to the session handler.
struct RawSocketTransport {
    tx: mpsc::UnboundedSender<Outbound>,
    serializer: Arc<dyn Serializer>,
    /// Largest frame the peer accepts, from its handshake length nibble.
    peer_max_length: usize,
    open: Arc<AtomicBool>,
}

impl TransportHandle for RawSocketTransport {
    fn send(&self, msg: WampMessage) -> WampResult<()> {
        if !self.is_open() {
            return Err(WampError::TransportLost);
        }
        let payload = self.serializer.serialize(&msg)?;
        if payload.len() > self.peer_max_length {
            return Err(WampError::Transport(format!(
                "serialized message ({} octets) exceeds peer frame limit ({})",
                payload.len(),
                self.peer_max_length
            )));
        }
        self.tx
            .send(Outbound::Message(payload))
            .map_err(|_| WampError::TransportLost)
    }

    fn close(&self) -> WampResult<()> {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Outbound::Close);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub struct WampRawSocketServer {
    factory: Arc<dyn SessionFactory>,
    serializers: SerializerRegistry,
}

impl WampRawSocketServer {
    pub fn new(factory: Arc<dyn SessionFactory>, serializers: SerializerRegistry) -> Self {
        Self {
            factory,
            serializers,
        }
    }

    fn serializer_for_nibble(&self, nibble: u8) -> Option<(&'static str, Arc<dyn Serializer>)> {
        let id = match nibble {
            1 => "json",
            3 => "cbor",
            _ => return None,
        };
        self.serializers.get(id).map(|s| (id, s))
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let len = payload.len();
    let header = [
        frame_type,
        (len >> 16) as u8,
        (len >> 8) as u8,
        len as u8,
    ];
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

#[async_trait]
impl StreamHandler for WampRawSocketServer {
    async fn handle(&self, mut stream: PrefixedStream, peer: SocketAddr) -> WampResult<()> {
        let mut handshake = [0u8; 4];
        if stream.read_exact(&mut handshake).await.is_err() {
            return Ok(());
        }
        if handshake[0] != MAGIC {
            debug!(peer = %peer, "bad RawSocket magic, dropping connection");
            return Ok(());
        }
        if handshake[2] != 0 || handshake[3] != 0 {
            stream
                .write_all(&[MAGIC, ERR_RESERVED_BITS << 4, 0, 0])
                .await?;
            return Ok(());
        }

        let serializer_nibble = handshake[1] & 0x0F;
        let length_exponent = (handshake[1] >> 4) as u32;
        let peer_max_length = 1usize << (9 + length_exponent);

        let Some((serializer_id, serializer)) = self.serializer_for_nibble(serializer_nibble)
        else {
            debug!(
                peer = %peer,
                serializer = serializer_nibble,
                "unsupported RawSocket serializer"
            );
            stream
                .write_all(&[MAGIC, ERR_SERIALIZER_UNSUPPORTED << 4, 0, 0])
                .await?;
            return Ok(());
        };

        stream
            .write_all(&[MAGIC, (MAX_LENGTH_EXPONENT << 4) | serializer_nibble, 0, 0])
            .await?;

        let mut details = TransportDetails::new(TransportType::RawSocket);
        details.protocol = Some(format!("wamp.{WAMP_VERSION}.{serializer_id}"));
        details.peer = Some(peer.to_string());

        info!(
            peer = %peer,
            serializer = serializer_id,
            max_frame = peer_max_length,
            "RawSocket transport opened"
        );

        let mut handler = self.factory.create_session(&details);
        let open = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Arc::new(RawSocketTransport {
            tx: tx.clone(),
            serializer: Arc::clone(&serializer),
            peer_max_length,
            open: Arc::clone(&open),
        });
        handler.on_open(transport);

        let (mut reader, mut writer) = tokio::io::split(stream);
        let writer_task = tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let (frame_type, payload) = match outbound {
                    Outbound::Message(payload) => (MSG_REGULAR, payload),
                    Outbound::Pong(payload) => (MSG_PONG, payload),
                    Outbound::Close => break,
                };
                if write_frame(&mut writer, frame_type, &payload).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let was_clean = 'read: loop {
            let mut header = [0u8; 4];
            if reader.read_exact(&mut header).await.is_err() {
                // TCP close is the only way a RawSocket connection ends
                break 'read true;
            }
            let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
            if len > SERVER_MAX_LENGTH {
                warn!(peer = %peer, len, "frame exceeds advertised maximum");
                break 'read false;
            }
            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).await.is_err() {
                break 'read false;
            }

            match header[0] {
                MSG_REGULAR => {
                    let messages = match serializer.unserialize(&payload) {
                        Ok(messages) => messages,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "dropping connection on bad payload");
                            break 'read false;
                        }
                    };
                    for msg in messages {
                        if let Err(e) = handler.on_message(msg) {
                            warn!(peer = %peer, error = %e, "session rejected message");
                            break 'read false;
                        }
                    }
                }
                MSG_PING => {
                    let _ = tx.send(Outbound::Pong(payload));
                }
                MSG_PONG => {}
                other => {
                    warn!(peer = %peer, frame_type = other, "unknown frame type");
                    break 'read false;
                }
            }
        };

        open.store(false, Ordering::SeqCst);
        handler.on_close(was_clean);
        let _ = tx.send(Outbound::Close);
        drop(tx);
        let _ = writer_task.await;

        info!(peer = %peer, was_clean, "RawSocket transport closed");
        Ok(())
    }
}
