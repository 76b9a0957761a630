use super::types::{CloseReason, Frame, SessionError};
use crate::config::{expand_home, AgentConfig};
use crate::protocol::MAX_FRAME_SIZE;
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use native_tls::{Certificate, Identity, Protocol, TlsConnector};
use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, error::ProtocolError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::{debug, info};

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = SessionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, SessionError>> + Send>>;

/// An open, handshaken connection to the hub.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections to the hub.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and complete the handshake, presenting `token` as a bearer credential.
    async fn connect(&self, endpoint: &Endpoint, token: &str) -> Result<Connection, SessionError>;
}

/// TLS options for `wss://` endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub verify: bool,
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate and key, both PEM
    pub client_identity: Option<(PathBuf, PathBuf)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub tls: Option<TlsSettings>,
    pub max_frame_size: usize,
    /// Limit on opening the connection, handshake included
    pub connect_timeout: Duration,
}

impl Endpoint {
    pub fn from_config(config: &AgentConfig) -> Self {
        let hub = &config.hub;
        let tls = hub.tls.then(|| TlsSettings {
            verify: hub.verify_tls,
            ca_cert_path: hub.ca_cert_path.as_deref().map(expand_home),
            client_identity: match (&hub.client_cert_path, &hub.client_key_path) {
                (Some(cert), Some(key)) => Some((expand_home(cert), expand_home(key))),
                _ => None,
            },
        });

        Self {
            url: config.hub_url(),
            tls,
            max_frame_size: MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(hub.connect_timeout_secs),
        }
    }
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, endpoint: &Endpoint, token: &str) -> Result<Connection, SessionError> {
        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Handshake(format!("invalid hub url: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| SessionError::Auth(format!("token is not a valid header value: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(endpoint.max_frame_size);
        ws_config.max_frame_size = Some(endpoint.max_frame_size);

        let connector = match &endpoint.tls {
            Some(settings) => Some(Connector::NativeTls(tls_connector(settings)?)),
            None => None,
        };

        debug!(url = %endpoint.url, tls = endpoint.tls.is_some(), "Opening hub connection");
        let (ws, response) =
            connect_async_tls_with_config(request, Some(ws_config), false, connector)
                .await
                .map_err(connect_error)?;
        info!(url = %endpoint.url, status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(SessionError::from)
            .with(|frame: Frame| future::ready(Ok::<_, SessionError>(Message::from(frame))));
        let stream = stream.map(|message| message.map(Frame::from).map_err(SessionError::from));

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn tls_connector(settings: &TlsSettings) -> Result<TlsConnector, SessionError> {
    let mut builder = TlsConnector::builder();
    builder.min_protocol_version(Some(Protocol::Tlsv12));

    if let Some(path) = &settings.ca_cert_path {
        let pem = std::fs::read(path)
            .map_err(|e| SessionError::Tls(format!("read {}: {}", path.display(), e)))?;
        let cert = Certificate::from_pem(&pem)
            .map_err(|e| SessionError::Tls(format!("parse {}: {}", path.display(), e)))?;
        builder.add_root_certificate(cert);
    }

    if let Some((cert_path, key_path)) = &settings.client_identity {
        let cert = std::fs::read(cert_path)
            .map_err(|e| SessionError::Tls(format!("read {}: {}", cert_path.display(), e)))?;
        let key = std::fs::read(key_path)
            .map_err(|e| SessionError::Tls(format!("read {}: {}", key_path.display(), e)))?;
        let identity = Identity::from_pkcs8(&cert, &key)
            .map_err(|e| SessionError::Tls(format!("client identity: {}", e)))?;
        builder.identity(identity);
    }

    if !settings.verify {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }

    builder
        .build()
        .map_err(|e| SessionError::Tls(e.to_string()))
}

/// Classify a failure while opening the connection.
fn connect_error(err: tungstenite::Error) -> SessionError {
    match err {
        tungstenite::Error::Http(response) => {
            SessionError::Handshake(format!("hub answered HTTP {}", response.status()))
        }
        tungstenite::Error::Tls(e) => SessionError::Tls(e.to_string()),
        tungstenite::Error::Io(e) => SessionError::Transport(e.to_string()),
        other => SessionError::Handshake(other.to_string()),
    }
}

/// Classify a failure on an established connection.
impl From<tungstenite::Error> for SessionError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                SessionError::Truncated(err.to_string())
            }
            tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                SessionError::Truncated(err.to_string())
            }
            tungstenite::Error::Io(e) => SessionError::Truncated(e.to_string()),
            other => SessionError::Transport(other.to_string()),
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
                code: CloseCode::from(r.code),
                reason: Cow::Owned(r.reason),
            })),
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(close) => Frame::Close(
                close.map(|c| CloseReason::new(u16::from(c.code), c.reason.into_owned())),
            ),
            Message::Frame(raw) => Frame::Binary(raw.into_data()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    #[test]
    fn test_endpoint_from_plain_config() {
        let config = AgentConfig::default();
        let endpoint = Endpoint::from_config(&config);
        assert_eq!(endpoint.url, "ws://localhost:6789");
        assert!(endpoint.tls.is_none());
        assert_eq!(endpoint.max_frame_size, 32 * 1024 * 1024);
        assert_eq!(endpoint.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_endpoint_from_tls_config() {
        let mut config = AgentConfig::default();
        config.hub.host = "hub.example.net".to_string();
        config.hub.port = 443;
        config.hub.tls = true;
        config.hub.verify_tls = true;
        config.hub.ca_cert_path = Some("/etc/hub/ca.pem".to_string());
        config.hub.client_cert_path = Some("/etc/hub/client.pem".to_string());
        config.hub.client_key_path = Some("/etc/hub/client.key".to_string());

        let endpoint = Endpoint::from_config(&config);
        assert_eq!(endpoint.url, "wss://hub.example.net:443");
        let tls = endpoint.tls.unwrap();
        assert!(tls.verify);
        assert_eq!(tls.ca_cert_path, Some(PathBuf::from("/etc/hub/ca.pem")));
        assert_eq!(
            tls.client_identity,
            Some((
                PathBuf::from("/etc/hub/client.pem"),
                PathBuf::from("/etc/hub/client.key")
            ))
        );
    }

    #[test]
    fn test_close_frame_conversion() {
        let message = Message::from(Frame::Close(Some(CloseReason::new(1000, "bye"))));
        match Frame::from(message) {
            Frame::Close(Some(reason)) => {
                assert_eq!(reason.code, 1000);
                assert_eq!(reason.reason, "bye");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_stream_error_classification() {
        assert!(matches!(
            SessionError::from(tungstenite::Error::ConnectionClosed),
            SessionError::Truncated(_)
        ));
        assert!(matches!(
            SessionError::from(tungstenite::Error::Protocol(
                ProtocolError::ResetWithoutClosingHandshake
            )),
            SessionError::Truncated(_)
        ));
        assert!(matches!(
            SessionError::from(tungstenite::Error::Utf8),
            SessionError::Transport(_)
        ));
    }

    #[test]
    fn test_missing_ca_cert_is_tls_error() {
        let settings = TlsSettings {
            verify: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            client_identity: None,
        };
        assert!(matches!(
            tls_connector(&settings),
            Err(SessionError::Tls(_))
        ));
    }
}
