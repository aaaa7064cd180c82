//! WebSocket implementation of [`Transport`] and [`Connector`], built on
//! `tokio-tungstenite`.
//!
//! The server speaks JSON-RPC in text frames only, so binary, ping and pong
//! frames are skipped on receive (tungstenite answers pings internally).
use std::borrow::Cow;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

use crate::transport::{Connector, Transport};

/// One established WebSocket connection to the server.
pub struct WsTransport {
    url: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Transport for WsTransport {
    type Error = WsError;

    fn remote_peer(&self) -> Cow<'static, str> {
        self.url.clone().into()
    }

    async fn send_message(&mut self, message: String) -> Result<(), Self::Error> {
        trace!(len = message.len(), "sending text frame");
        self.stream.send(Message::Text(message.into())).await
    }

    async fn receive_message(&mut self) -> Result<Option<String>, Self::Error> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "received close frame");
                    return Ok(None);
                }
                // Pings are answered by tungstenite itself; nothing else the
                // server could send carries JSON-RPC traffic.
                Some(Ok(other)) => {
                    trace!(kind = %message_kind(&other), "skipping non-text frame");
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}

/// Connector that dials a fixed `ws://` or `wss://` URL, optionally with
/// extra headers on the upgrade request (for reverse proxies that expect
/// authentication).
pub struct WsConnector {
    url: String,
    headers: Vec<(String, String)>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Add a header to the WebSocket handshake request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl Connector for WsConnector {
    type Transport = WsTransport;
    type Error = WsError;

    fn target(&self) -> Cow<'static, str> {
        self.url.clone().into()
    }

    async fn connect(&self) -> Result<Self::Transport, Self::Error> {
        let mut request = self.url.as_str().into_client_request()?;
        for (name, value) in &self.headers {
            let name = http::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(http::Error::from)?;
            let value = http::header::HeaderValue::from_str(value).map_err(http::Error::from)?;
            request.headers_mut().insert(name, value);
        }

        let (stream, response) = connect_async(request).await?;
        debug!(url = %self.url, status = %response.status(), "websocket handshake complete");

        Ok(WsTransport {
            url: self.url.clone(),
            stream,
        })
    }
}
