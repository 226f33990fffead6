//! Viewer endpoint: `ws://host:port/?project=<id>`.
//!
//! A plain acceptor thread does the handshake and hands the socket to the
//! relay. The project id is read from the query during the handshake, and
//! a request without one is refused with 400.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;

use super::{Relay, RelayError};
use crate::config::RelayConfig;
use crate::core::ProjectId;
use crate::{debug, log};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Value of the `project` query parameter, if present and non-empty.
pub fn project_from_query(query: Option<&str>) -> Option<ProjectId> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "project")
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .map(ProjectId::new)
}

pub struct ViewerServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ViewerServer {
    /// Bind and start accepting viewers.
    pub fn start(config: &RelayConfig, relay: Relay) -> Result<Self, RelayError> {
        let listener = TcpListener::bind((config.interface, config.port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("relay-accept".into())
            .spawn(move || accept_loop(listener, relay, flag))?;

        log!("relay"; "viewers on ws://{}/?project=<id>", addr);
        Ok(Self {
            addr,
            stop,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ViewerServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, relay: Relay, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("relay"; "connection from {}", peer);
                let relay = relay.clone();
                // Handshakes block; keep them off the accept thread.
                std::thread::spawn(move || accept_viewer(stream, relay));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log!("relay"; "accept error: {}", e);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn accept_viewer(stream: TcpStream, relay: Relay) {
    if stream.set_nonblocking(false).is_err()
        || stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).is_err()
    {
        return;
    }

    let mut project = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match project_from_query(request.uri().query()) {
            Some(id) => {
                project = Some(id);
                Ok(response)
            }
            None => {
                let mut refused = ErrorResponse::new(Some("missing `project` query parameter".into()));
                *refused.status_mut() = StatusCode::BAD_REQUEST;
                Err(refused)
            }
        }
    };

    let ws = match tungstenite::accept_hdr(stream, callback) {
        Ok(ws) => ws,
        Err(e) => {
            debug!("relay"; "handshake refused: {}", e);
            return;
        }
    };
    let Some(project) = project else {
        return;
    };

    if ws.get_ref().set_read_timeout(None).is_err() || ws.get_ref().set_nonblocking(true).is_err()
    {
        return;
    }
    if let Err(e) = relay.add_viewer(&project, Box::new(ws)) {
        log!("relay"; "viewer for {} rejected: {}", project, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_from_query() {
        assert_eq!(
            project_from_query(Some("project=shop")),
            Some(ProjectId::new("shop"))
        );
        assert_eq!(
            project_from_query(Some("x=1&project=a-b&y")),
            Some(ProjectId::new("a-b"))
        );
        assert_eq!(project_from_query(Some("project=")), None);
        assert_eq!(project_from_query(Some("other=1")), None);
        assert_eq!(project_from_query(None), None);
    }
}
