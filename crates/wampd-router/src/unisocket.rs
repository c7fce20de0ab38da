//! Uni-socket listener: RawSocket, MQTT and HTTP on one port.
//!
//! Classifies each incoming connection by its first bytes: `0x7F` is a
//! WAMP RawSocket handshake, `0x10` an MQTT CONNECT, anything else is
//! treated as HTTP and buffered up to the end of the request line. The
//! request path's first non-empty segment selects a WebSocket handler;
//! unmatched paths fall back to the plain-web handler. Every byte consumed
//! during classification is replayed into the chosen handler through
//! [`PrefixedStream`], so handlers see the connection from octet zero.
//!
//! Connections that cannot be classified, or for which no handler is
//! configured, are dropped without a response.

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use wampd_core::WampResult;

/// First octet of a WAMP RawSocket handshake.
const RAWSOCKET_MAGIC: u8 = 0x7F;
/// First octet of an MQTT CONNECT packet.
const MQTT_CONNECT: u8 = 0x10;
/// Classification gives up if no request line terminator shows up in time.
const MAX_REQUEST_LINE: usize = 8192;

/// Byte stream a classified connection is handed over as.
pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIo for T {}

pub type BoxedStream = Box<dyn StreamIo>;

/// A stream with classification bytes prepended.
///
/// Reads serve the replay prefix first, then fall through to the inner
/// stream; writes always go straight through.
pub struct PrefixedStream {
    prefix: Vec<u8>,
    pos: usize,
    inner: BoxedStream,
}

impl PrefixedStream {
    pub fn new(prefix: Vec<u8>, inner: BoxedStream) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.remaining());
            buf.put_slice(&self.prefix[self.pos..self.pos + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Handles one classified connection until it ends.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, stream: PrefixedStream, peer: SocketAddr) -> WampResult<()>;
}

/// Where a connection was routed, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    RawSocket,
    Mqtt,
    WebSocket,
    Web,
}

/// The uni-socket server: protocol handlers keyed by classification.
#[derive(Default)]
pub struct UniSocketServer {
    rawsocket: Option<Arc<dyn StreamHandler>>,
    mqtt: Option<Arc<dyn StreamHandler>>,
    web: Option<Arc<dyn StreamHandler>>,
    websocket_map: HashMap<String, Arc<dyn StreamHandler>>,
}

impl UniSocketServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rawsocket(mut self, handler: Arc<dyn StreamHandler>) -> Self {
        self.rawsocket = Some(handler);
        self
    }

    pub fn with_mqtt(mut self, handler: Arc<dyn StreamHandler>) -> Self {
        self.mqtt = Some(handler);
        self
    }

    pub fn with_web(mut self, handler: Arc<dyn StreamHandler>) -> Self {
        self.web = Some(handler);
        self
    }

    /// Route WebSocket upgrades whose first path segment equals `path`.
    pub fn add_websocket(mut self, path: impl Into<String>, handler: Arc<dyn StreamHandler>) -> Self {
        self.websocket_map.insert(path.into(), handler);
        self
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn listen(self: Arc<Self>, addr: SocketAddr) -> WampResult<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "uni-socket listener up");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.serve(stream, peer).await {
                    debug!(peer = %peer, error = %e, "connection ended with error");
                }
            });
        }
    }

    /// Classify one connection and hand it to the selected handler.
    pub async fn serve<S>(&self, mut stream: S, peer: SocketAddr) -> WampResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut first = [0u8; 1];
        let n = stream.read(&mut first).await?;
        if n == 0 {
            return Ok(());
        }

        let (classification, handler, prefix) = match first[0] {
            RAWSOCKET_MAGIC => (Classification::RawSocket, self.rawsocket.clone(), vec![first[0]]),
            MQTT_CONNECT => (Classification::Mqtt, self.mqtt.clone(), vec![first[0]]),
            _ => {
                let mut buffered = vec![first[0]];
                let Some(line_end) = read_request_line(&mut stream, &mut buffered).await? else {
                    debug!(peer = %peer, "no HTTP request line, dropping connection");
                    return Ok(());
                };
                match self.route_http(&buffered[..line_end]) {
                    Some((classification, handler)) => {
                        (classification, Some(handler), buffered)
                    }
                    None => {
                        debug!(peer = %peer, "unroutable HTTP request, dropping connection");
                        return Ok(());
                    }
                }
            }
        };

        let Some(handler) = handler else {
            debug!(
                peer = %peer,
                classification = ?classification,
                "no handler configured, dropping connection"
            );
            return Ok(());
        };

        debug!(peer = %peer, classification = ?classification, "connection classified");
        let stream = PrefixedStream::new(prefix, Box::new(stream));
        handler.handle(stream, peer).await
    }

    /// Pick a handler from the request line (everything before CRLF).
    fn route_http(&self, line: &[u8]) -> Option<(Classification, Arc<dyn StreamHandler>)> {
        let line = std::str::from_utf8(line).ok()?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [_method, uri, _version] = tokens[..] else {
            return None;
        };

        let path = uri.split('?').next().unwrap_or(uri);
        let path = percent_decode_str(path).decode_utf8().ok()?;

        if let Some(segment) = path.split('/').find(|s| !s.is_empty()) {
            if let Some(handler) = self.websocket_map.get(segment) {
                return Some((Classification::WebSocket, Arc::clone(handler)));
            }
        }
        self.web
            .clone()
            .map(|handler| (Classification::Web, handler))
    }
}

/// Buffer from `stream` into `buffered` until a CRLF terminates the request
/// line. Returns the offset just past the line, or `None` if the peer went
/// away or exceeded the line length cap.
async fn read_request_line<S: AsyncRead + Unpin>(
    stream: &mut S,
    buffered: &mut Vec<u8>,
) -> std::io::Result<Option<usize>> {
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = buffered.windows(2).position(|w| w == b"\r\n") {
            return Ok(Some(pos + 2));
        }
        if buffered.len() > MAX_REQUEST_LINE {
            warn!(len = buffered.len(), "HTTP request line too long");
            return Ok(None);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::oneshot;

    fn peer() -> SocketAddr {
        "127.0.0.1:40812".parse().unwrap()
    }

    /// Reads the connection to EOF, reports the bytes seen, echoes them.
    struct EchoHandler {
        seen: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    }

    impl EchoHandler {
        fn new() -> (Arc<Self>, oneshot::Receiver<Vec<u8>>) {
            let (tx, rx) = oneshot::channel();
            (
                Arc::new(Self {
                    seen: Mutex::new(Some(tx)),
                }),
                rx,
            )
        }
    }

    #[async_trait]
    impl StreamHandler for EchoHandler {
        async fn handle(&self, mut stream: PrefixedStream, _peer: SocketAddr) -> WampResult<()> {
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes).await?;
            stream.write_all(&bytes).await?;
            stream.shutdown().await?;
            if let Some(tx) = self.seen.lock().take() {
                let _ = tx.send(bytes);
            }
            Ok(())
        }
    }

    async fn run_server(
        server: UniSocketServer,
        client_bytes: &[u8],
    ) -> (DuplexStream, tokio::task::JoinHandle<WampResult<()>>) {
        let (mut client, inbound) = tokio::io::duplex(64 * 1024);
        client.write_all(client_bytes).await.unwrap();
        client.shutdown().await.unwrap();
        let task = tokio::spawn(async move { server.serve(inbound, peer()).await });
        (client, task)
    }

    async fn read_reply(client: &mut DuplexStream) -> Vec<u8> {
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn rawsocket_byte_routes_with_full_replay() {
        let (handler, seen) = EchoHandler::new();
        let server = UniSocketServer::new().with_rawsocket(handler);

        let bytes = b"\x7f0000000moredata";
        let (mut client, task) = run_server(server, bytes).await;

        assert_eq!(read_reply(&mut client).await, bytes);
        assert_eq!(seen.await.unwrap(), bytes);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn mqtt_byte_routes() {
        let (handler, seen) = EchoHandler::new();
        let server = UniSocketServer::new().with_mqtt(handler);

        let bytes = b"\x10\x20connectpacket";
        let (_client, task) = run_server(server, bytes).await;

        assert_eq!(seen.await.unwrap(), bytes);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unconfigured_protocol_drops_connection() {
        let server = UniSocketServer::new();
        let (mut client, task) = run_server(server, b"\x7f0000000").await;

        // server closes without writing anything
        assert!(read_reply(&mut client).await.is_empty());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn websocket_path_routes_by_first_segment() {
        let (handler, seen) = EchoHandler::new();
        let server = UniSocketServer::new().add_websocket("ws", handler);

        let request = b"GET /ws HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (_client, task) = run_server(server, request).await;

        assert_eq!(seen.await.unwrap(), request);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn percent_encoded_path_still_routes() {
        let (handler, seen) = EchoHandler::new();
        let server = UniSocketServer::new().add_websocket("ws", handler);

        let request = b"GET /%77%73?x=1 HTTP/1.1\r\n\r\n";
        let (_client, task) = run_server(server, request).await;

        assert_eq!(seen.await.unwrap(), request);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unmatched_path_falls_back_to_web() {
        let (ws_handler, _ws_seen) = EchoHandler::new();
        let (web_handler, web_seen) = EchoHandler::new();
        let server = UniSocketServer::new()
            .add_websocket("ws", ws_handler)
            .with_web(web_handler);

        let request = b"GET /index.html HTTP/1.1\r\n\r\n";
        let (_client, task) = run_server(server, request).await;

        assert_eq!(web_seen.await.unwrap(), request);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unmatched_path_without_web_drops() {
        let (ws_handler, _seen) = EchoHandler::new();
        let server = UniSocketServer::new().add_websocket("ws", ws_handler);

        let (mut client, task) = run_server(server, b"GET /other HTTP/1.1\r\n\r\n").await;
        assert!(read_reply(&mut client).await.is_empty());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_request_line_drops() {
        for request in [
            &b"GARBAGE\r\n"[..],
            &b"GET /ws\r\n"[..],
            &b"GET /ws HTTP/1.1 extra\r\n"[..],
        ] {
            let (ws_handler, _seen) = EchoHandler::new();
            let server = UniSocketServer::new().add_websocket("ws", ws_handler);
            let (mut client, task) = run_server(server, request).await;
            assert!(read_reply(&mut client).await.is_empty());
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn oversized_request_line_drops() {
        let (handler, _seen) = EchoHandler::new();
        let server = UniSocketServer::new().with_web(handler);

        let request = vec![b'A'; MAX_REQUEST_LINE + 64];
        let (mut client, task) = run_server(server, &request).await;
        assert!(read_reply(&mut client).await.is_empty());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn prefixed_stream_replays_before_inner() {
        let (client, inbound) = tokio::io::duplex(1024);
        let mut stream = PrefixedStream::new(b"head".to_vec(), Box::new(inbound));
        drop(client);

        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, b"head");
    }
}
