use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

use super::{BoxSink, BoxStream, ConnectRequest, FrameSink, FrameStream, Transport};
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on a proxy's CONNECT response head.
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Binary websocket transport, optionally tunnelled through an HTTP
/// CONNECT proxy.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
    proxy: Option<Url>,
}

impl WebSocketTransport {
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            proxy: None,
        }
    }

    /// Route connections through `http://host:port`.
    pub fn with_proxy(mut self, proxy: &str) -> Result<Self> {
        let url = Url::parse(proxy)
            .map_err(|e| Error::Config(format!("invalid proxy address {proxy}: {e}")))?;
        if url.scheme() != "http" {
            return Err(Error::Config(format!(
                "unsupported proxy scheme {:?}, only http is supported",
                url.scheme()
            )));
        }
        self.proxy = Some(url);
        Ok(self)
    }

    async fn open(&self, request: &ConnectRequest) -> Result<WsStream> {
        let mut ws_request = request.url.as_str().into_client_request()?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Transport(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Transport(format!("invalid header value for {name}: {e}")))?;
            ws_request.headers_mut().insert(name, value);
        }

        match &self.proxy {
            None => {
                let (socket, response) = tokio_tungstenite::connect_async(ws_request).await?;
                debug!(status = %response.status(), "websocket connected");
                Ok(socket)
            }
            Some(proxy) => {
                let target = Url::parse(&request.url)
                    .map_err(|e| Error::Transport(format!("invalid url {}: {e}", request.url)))?;
                let stream = tunnel(proxy, &target).await?;
                let (socket, response) =
                    tokio_tungstenite::client_async_tls(ws_request, stream).await?;
                debug!(status = %response.status(), proxy = %proxy, "websocket connected via proxy");
                Ok(socket)
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, request: &ConnectRequest) -> Result<(BoxSink, BoxStream)> {
        let socket = tokio::time::timeout(self.connect_timeout, self.open(request))
            .await
            .map_err(|_| Error::ConnectTimeout(self.connect_timeout.as_secs()))??;

        let (sink, stream) = socket.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsFrames { stream })))
    }
}

/// Open a TCP tunnel to `target` through an HTTP CONNECT proxy.
async fn tunnel(proxy: &Url, target: &Url) -> Result<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| Error::Config(format!("proxy address has no host: {proxy}")))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(8080);
    let target_host = target
        .host_str()
        .ok_or_else(|| Error::Transport(format!("url has no host: {target}")))?;
    let target_port = target.port_or_known_default().unwrap_or(443);
    let authority = format!("{target_host}:{target_port}");

    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;
    stream
        .write_all(format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n").as_bytes())
        .await?;

    let mut head = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        if head.len() > MAX_PROXY_RESPONSE {
            return Err(Error::Transport("proxy response too large".to_string()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Transport("proxy closed during CONNECT".to_string()));
        }
        head.extend_from_slice(&chunk[..n]);
    }

    let status_line = String::from_utf8_lossy(&head);
    let status_line = status_line.lines().next().unwrap_or_default();
    let accepted = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code == "200");
    if !accepted {
        return Err(Error::Transport(format!("proxy refused CONNECT: {status_line}")));
    }

    trace!(proxy = %proxy, target = %authority, "proxy tunnel established");
    Ok(stream)
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.sink.send(Message::Binary(frame)).await?;
        Ok(())
    }

    async fn ping(&mut self, payload: Bytes) -> Result<()> {
        self.sink.send(Message::Ping(payload)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}

struct WsFrames {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrames {
    async fn next_frame(&mut self) -> Option<Result<Bytes>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Text(text)) => {
                    return Some(Ok(Bytes::copy_from_slice(text.as_bytes())));
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "websocket closed by peer");
                    return None;
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_proxy_must_be_http() {
        let transport = WebSocketTransport::new(Duration::from_secs(1));
        assert!(transport.clone().with_proxy("http://127.0.0.1:7890").is_ok());
        assert!(matches!(
            transport.clone().with_proxy("socks5://127.0.0.1:1080"),
            Err(Error::Config(_))
        ));
        assert!(transport.with_proxy("not a url").is_err());
    }

    async fn fake_proxy(reply: &'static [u8]) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(reply).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (Url::parse(&format!("http://{addr}")).unwrap(), handle)
    }

    #[tokio::test]
    async fn test_tunnel_sends_connect() {
        let (proxy, server) = fake_proxy(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        let target = Url::parse("wss://push.example.com/ws?room=1").unwrap();

        assert!(tunnel(&proxy, &target).await.is_ok());
        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT push.example.com:443 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_tunnel_refused() {
        let (proxy, _server) = fake_proxy(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let target = Url::parse("wss://push.example.com/ws").unwrap();

        let err = tunnel(&proxy, &target).await.unwrap_err();
        assert!(err.to_string().contains("407"));
    }

    #[tokio::test]
    async fn test_sink_sends_data_and_ping_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let mut received = Vec::new();
            while received.len() < 2 {
                match ws.next().await.unwrap().unwrap() {
                    message @ (Message::Binary(_) | Message::Ping(_)) => received.push(message),
                    _ => {}
                }
            }
            received
        });

        let transport = WebSocketTransport::new(Duration::from_secs(5));
        let (mut sink, _stream) = transport
            .connect(&ConnectRequest {
                url: format!("ws://{addr}/ws"),
                headers: vec![("user-agent".into(), "test".into())],
            })
            .await
            .unwrap();
        sink.send(Bytes::from_static(b"data")).await.unwrap();
        sink.ping(Bytes::from_static(b"hb")).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received[0], Message::Binary(Bytes::from_static(b"data")));
        assert_eq!(received[1], Message::Ping(Bytes::from_static(b"hb")));
    }
}
