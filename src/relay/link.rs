//! Connection seam between the relay and concrete sockets.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::protocol::Message;
use tungstenite::{Error as WsError, WebSocket};

use super::RelayError;
use crate::core::ProjectId;

/// One relayed message. Payloads pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// A bidirectional message link, polled without blocking.
pub trait RelayLink: Send {
    fn send(&mut self, frame: Frame) -> Result<(), RelayError>;

    /// Next waiting frame, `Ok(None)` when nothing is waiting.
    ///
    /// `Err(RelayError::Closed)` once the peer has gone away.
    fn try_recv(&mut self) -> Result<Option<Frame>, RelayError>;

    fn close(&mut self);
}

fn would_block(err: &WsError) -> bool {
    matches!(err, WsError::Io(e) if e.kind() == ErrorKind::WouldBlock)
}

fn map_ws_error(err: WsError) -> RelayError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => RelayError::Closed,
        WsError::Io(e) => RelayError::Io(e),
        other => RelayError::WebSocket(other.to_string()),
    }
}

/// Expects the underlying stream in non-blocking mode.
impl RelayLink for WebSocket<TcpStream> {
    fn send(&mut self, frame: Frame) -> Result<(), RelayError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
        };
        match WebSocket::send(self, message) {
            Ok(()) => Ok(()),
            // Queued in the write buffer; flushed on the next call.
            Err(e) if would_block(&e) => Ok(()),
            Err(e) => Err(map_ws_error(e)),
        }
    }

    fn try_recv(&mut self) -> Result<Option<Frame>, RelayError> {
        loop {
            match self.read() {
                Ok(Message::Text(text)) => return Ok(Some(Frame::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(data)) => return Ok(Some(Frame::Binary(data.to_vec()))),
                Ok(Message::Close(_)) => return Err(RelayError::Closed),
                // Ping/pong are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) if would_block(&e) => return Ok(None),
                Err(e) => return Err(map_ws_error(e)),
            }
        }
    }

    fn close(&mut self) {
        let _ = WebSocket::close(self, None);
        let _ = self.flush();
    }
}

/// Dials a running runtime's live-update channel.
pub trait UpstreamConnector: Send + Sync {
    fn connect(&self, project_id: &ProjectId, port: u16) -> Result<Box<dyn RelayLink>, RelayError>;
}

/// WebSocket client to `ws://127.0.0.1:<port><path>`.
pub struct WsConnector {
    path: String,
    protocol: Option<String>,
    timeout: Duration,
}

impl WsConnector {
    pub fn new(path: impl Into<String>, protocol: Option<String>) -> Self {
        Self {
            path: path.into(),
            protocol,
            timeout: Duration::from_secs(2),
        }
    }
}

impl UpstreamConnector for WsConnector {
    fn connect(&self, project_id: &ProjectId, port: u16) -> Result<Box<dyn RelayLink>, RelayError> {
        let upstream = |message: String| RelayError::Upstream {
            project: project_id.clone(),
            message,
        };

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;

        let mut request = format!("ws://{addr}{}", self.path)
            .into_client_request()
            .map_err(|e| upstream(e.to_string()))?;
        if let Some(protocol) = &self.protocol {
            let value = HeaderValue::from_str(protocol).map_err(|e| upstream(e.to_string()))?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        let (ws, _response) =
            tungstenite::client(request, stream).map_err(|e| upstream(e.to_string()))?;
        ws.get_ref().set_read_timeout(None)?;
        ws.get_ref().set_nonblocking(true)?;
        Ok(Box::new(ws))
    }
}

impl<F> UpstreamConnector for F
where
    F: Fn(&ProjectId, u16) -> Result<Box<dyn RelayLink>, RelayError> + Send + Sync,
{
    fn connect(&self, project_id: &ProjectId, port: u16) -> Result<Box<dyn RelayLink>, RelayError> {
        self(project_id, port)
    }
}
