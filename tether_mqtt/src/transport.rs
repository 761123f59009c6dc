// Copyright (c) Tetherline.
// Licensed under the MIT License.

//! Byte transports: plain TCP, TLS, and (optionally) WebSocket tunnels.
//!
//! A [`Transport`] is an ordered bidirectional byte channel. Writes are
//! chunked to [`MESSAGE_CAPACITY`] so a large payload spans multiple
//! transport messages; reads append whatever arrived into a caller-owned
//! buffer.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::connection_settings::TlsOptions;
use crate::error::{ClientError, ErrorKind};

#[cfg(feature = "websockets")]
use futures_util::{SinkExt, StreamExt};
#[cfg(feature = "websockets")]
use tokio_tungstenite::tungstenite::protocol::Message;
#[cfg(feature = "websockets")]
use tokio_tungstenite::WebSocketStream;

/// Per-message write capacity. Larger payloads span multiple messages.
pub(crate) const MESSAGE_CAPACITY: usize = 16 * 1024;

/// WebSocket upgrade request, exposed so transformers can sign or annotate it.
#[cfg(feature = "websockets")]
pub type WebSocketRequest = tokio_tungstenite::tungstenite::handshake::client::Request;
/// WebSocket upgrade response, exposed so validators can inspect it.
#[cfg(feature = "websockets")]
pub type WebSocketResponse = tokio_tungstenite::tungstenite::handshake::client::Response;

/// Rewrites the upgrade request before it is sent (e.g. request signing).
#[cfg(feature = "websockets")]
pub type WebSocketRequestTransformer = Box<dyn FnMut(WebSocketRequest) -> WebSocketRequest + Send>;
/// Inspects the upgrade response before the channel is accepted.
#[cfg(feature = "websockets")]
pub type WebSocketResponseValidator =
    Box<dyn Fn(&WebSocketResponse) -> Result<(), ClientError> + Send>;

/// Options for tunneling the connection over WebSockets.
#[derive(Default)]
pub struct WebSocketOptions {
    #[cfg(feature = "websockets")]
    pub(crate) transformer: Option<WebSocketRequestTransformer>,
    #[cfg(feature = "websockets")]
    pub(crate) validator: Option<WebSocketResponseValidator>,
}

impl WebSocketOptions {
    /// Options that use the plain upgrade handshake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handshake request transformer.
    #[cfg(feature = "websockets")]
    #[must_use]
    pub fn with_transformer(
        mut self,
        transformer: impl FnMut(WebSocketRequest) -> WebSocketRequest + Send + 'static,
    ) -> Self {
        self.transformer = Some(Box::new(transformer));
        self
    }

    /// Install a handshake response validator.
    #[cfg(feature = "websockets")]
    #[must_use]
    pub fn with_validator(
        mut self,
        validator: impl Fn(&WebSocketResponse) -> Result<(), ClientError> + Send + 'static,
    ) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }
}

/// HTTP proxy to tunnel the connection through via CONNECT.
#[derive(Clone, Debug)]
pub struct HttpProxyOptions {
    /// Proxy host
    pub hostname: String,
    /// Proxy port
    pub port: u16,
    /// Username for proxy basic auth
    pub username: Option<String>,
    /// Password for proxy basic auth
    pub password: Option<String>,
}

/// Everything needed to (re)establish a channel, snapshotted out of the
/// connection config so no lock is held across connect I/O.
#[derive(Clone)]
pub(crate) struct Endpoint {
    pub hostname: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub tls: Option<TlsOptions>,
    pub proxy: Option<HttpProxyOptions>,
}

/// A TCP stream, optionally wrapped in TLS.
pub(crate) enum MaybeTls {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// An established channel to the broker.
pub(crate) enum Transport {
    Stream(MaybeTls),
    #[cfg(feature = "websockets")]
    Ws(Box<WebSocketStream<MaybeTls>>),
}

impl Transport {
    /// Read whatever bytes are available into `buf`. Returns the number of
    /// bytes appended; 0 signals an orderly remote close.
    pub(crate) async fn read_some(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Transport::Stream(s) => s.read_buf(buf).await,
            #[cfg(feature = "websockets")]
            Transport::Ws(ws) => loop {
                match ws.next().await {
                    None | Some(Ok(Message::Close(_))) => return Ok(0),
                    Some(Ok(Message::Binary(data))) => {
                        buf.extend_from_slice(&data);
                        return Ok(data.len());
                    }
                    // Control frames carry no MQTT bytes
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(io::Error::other(e)),
                }
            },
        }
    }

    /// Write `bytes`, splitting them across messages of at most
    /// [`MESSAGE_CAPACITY`] so the channel never sees an oversized message.
    pub(crate) async fn write_chunked(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            let split = bytes.len().min(MESSAGE_CAPACITY);
            let (chunk, rest) = bytes.split_at(split);
            match self {
                Transport::Stream(s) => s.write_all(chunk).await?,
                #[cfg(feature = "websockets")]
                Transport::Ws(ws) => ws
                    .send(Message::binary(chunk.to_vec()))
                    .await
                    .map_err(io::Error::other)?,
            }
            bytes = rest;
        }
        if let Transport::Stream(s) = self {
            s.flush().await?;
        }
        Ok(())
    }

    /// Close the channel. Errors are ignored; the channel is going away.
    pub(crate) async fn shutdown(&mut self) {
        match self {
            Transport::Stream(s) => {
                let _ = s.shutdown().await;
            }
            #[cfg(feature = "websockets")]
            Transport::Ws(ws) => {
                let _ = ws.close(None).await;
            }
        }
    }
}

/// Establish a channel to the endpoint, tunneling over WebSockets when `ws`
/// options are supplied.
pub(crate) async fn establish(
    endpoint: &Endpoint,
    ws: Option<&mut WebSocketOptions>,
) -> Result<Transport, ClientError> {
    let tcp = match &endpoint.proxy {
        Some(proxy) => tunnel_through_proxy(proxy, endpoint).await?,
        None => {
            timeout(
                endpoint.connect_timeout,
                TcpStream::connect((endpoint.hostname.as_str(), endpoint.port)),
            )
            .await
            .map_err(|_| ClientError::new(ErrorKind::Timeout))??
        }
    };
    let _ = tcp.set_nodelay(true);

    let stream = match &endpoint.tls {
        Some(tls) => MaybeTls::Tls(Box::new(wrap_tls(tcp, &endpoint.hostname, tls).await?)),
        None => MaybeTls::Plain(tcp),
    };

    match ws {
        None => Ok(Transport::Stream(stream)),
        #[cfg(feature = "websockets")]
        Some(options) => Ok(Transport::Ws(Box::new(
            upgrade_websocket(stream, endpoint, options).await?,
        ))),
        #[cfg(not(feature = "websockets"))]
        Some(_) => Err(ClientError::new(ErrorKind::BuiltWithoutWebsockets)),
    }
}

/// Open a TCP stream to the proxy and issue an HTTP CONNECT for the endpoint.
async fn tunnel_through_proxy(
    proxy: &HttpProxyOptions,
    endpoint: &Endpoint,
) -> Result<TcpStream, ClientError> {
    let mut stream = timeout(
        endpoint.connect_timeout,
        TcpStream::connect((proxy.hostname.as_str(), proxy.port)),
    )
    .await
    .map_err(|_| ClientError::new(ErrorKind::Timeout))??;

    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = endpoint.hostname,
        port = endpoint.port
    );
    if let Some(username) = &proxy.username {
        let credentials = format!("{username}:{}", proxy.password.as_deref().unwrap_or(""));
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read the status line and headers; the tunnel bytes start right after.
    // The peer stays silent until this client's CONNECT, so nothing past the
    // header terminator can arrive yet.
    let mut response = BytesMut::with_capacity(256);
    let mut scratch = [0_u8; 512];
    while !contains_header_terminator(&response) {
        if response.len() > 8192 {
            return Err(ClientError::new(ErrorKind::TransportFailure));
        }
        let n = stream.read(&mut scratch).await?;
        if n == 0 {
            return Err(ClientError::new(ErrorKind::TransportFailure));
        }
        response.extend_from_slice(&scratch[..n]);
    }

    let status = std::str::from_utf8(&response)
        .ok()
        .and_then(|s| s.split_whitespace().nth(1));
    if status == Some("200") {
        Ok(stream)
    } else {
        log::warn!(
            "proxy {}:{} refused CONNECT (status {:?})",
            proxy.hostname,
            proxy.port,
            status
        );
        Err(ClientError::new(ErrorKind::TransportFailure))
    }
}

fn contains_header_terminator(buf: &[u8]) -> bool {
    buf.windows(4).any(|window| window == b"\r\n\r\n")
}

/// Wrap an established TCP stream in TLS per the options.
async fn wrap_tls(
    tcp: TcpStream,
    hostname: &str,
    tls: &TlsOptions,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ClientError> {
    let mut roots = rustls::RootCertStore::empty();
    if let Some(ca_file) = &tls.ca_file {
        let pem = tokio::fs::read(ca_file).await?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            roots
                .add(cert?)
                .map_err(|e| ClientError::with_source(ErrorKind::TransportFailure, e))?;
        }
    } else {
        for cert in rustls_native_certs::load_native_certs()? {
            // Tolerate unusable entries in the OS store
            let _ = roots.add(cert);
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = match (&tls.cert_file, &tls.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let pem = tokio::fs::read(cert_file).await?;
            let certs = rustls_pemfile::certs(&mut pem.as_slice()).collect::<Result<Vec<_>, _>>()?;
            let pem = tokio::fs::read(key_file).await?;
            let key = rustls_pemfile::private_key(&mut pem.as_slice())?
                .ok_or_else(|| ClientError::new(ErrorKind::TransportFailure))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::with_source(ErrorKind::TransportFailure, e))?
        }
        _ => builder.with_no_client_auth(),
    };

    let server_name = tls
        .server_name
        .clone()
        .unwrap_or_else(|| hostname.to_string());
    let server_name = ServerName::try_from(server_name)
        .map_err(|e| ClientError::with_source(ErrorKind::TransportFailure, e))?;
    let connector = TlsConnector::from(Arc::new(config));
    Ok(connector.connect(server_name, tcp).await?)
}

/// Upgrade an established stream to a WebSocket channel speaking the `mqtt`
/// subprotocol.
#[cfg(feature = "websockets")]
async fn upgrade_websocket(
    stream: MaybeTls,
    endpoint: &Endpoint,
    options: &mut WebSocketOptions,
) -> Result<WebSocketStream<MaybeTls>, ClientError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    let scheme = if endpoint.tls.is_some() { "wss" } else { "ws" };
    let url = format!("{scheme}://{}:{}/mqtt", endpoint.hostname, endpoint.port);
    let mut request = url
        .into_client_request()
        .map_err(|e| ClientError::with_source(ErrorKind::TransportFailure, e))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static("mqtt"),
    );
    if let Some(transformer) = options.transformer.as_mut() {
        request = transformer(request);
    }

    let (ws, response) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(|e| ClientError::with_source(ErrorKind::TransportFailure, e))?;
    if let Some(validator) = &options.validator {
        validator(&response)?;
    }
    Ok(ws)
}
