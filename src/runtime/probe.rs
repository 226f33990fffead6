//! Readiness probing of a runtime's HTTP endpoint.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// 2xx response.
    Ready,
    /// Answered with a non-2xx status (usually 503 while bundling).
    NotReady(u16),
    /// Nothing listening yet, or the exchange failed.
    Unreachable,
}

/// Blocking probe, run off the async executor.
pub trait ReadinessProbe: Send + Sync {
    fn probe(&self, host: &str, port: u16) -> Readiness;
}

/// `GET <path>` over HTTP/1.1 with a short socket timeout.
pub struct HttpProbe {
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }
}

impl ReadinessProbe for HttpProbe {
    fn probe(&self, host: &str, port: u16) -> Readiness {
        let Some(addr) = (host, port).to_socket_addrs().ok().and_then(|mut a| a.next()) else {
            return Readiness::Unreachable;
        };
        let Ok(mut stream) = TcpStream::connect_timeout(&addr, self.timeout) else {
            return Readiness::Unreachable;
        };
        stream.set_read_timeout(Some(self.timeout)).ok();
        stream.set_write_timeout(Some(self.timeout)).ok();

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: close\r\n\r\n",
            self.path
        );
        if stream.write_all(request.as_bytes()).is_err() {
            return Readiness::Unreachable;
        }

        let mut status_line = String::new();
        if BufReader::new(stream).read_line(&mut status_line).is_err() {
            return Readiness::Unreachable;
        }

        match parse_status(&status_line) {
            Some(code) if (200..300).contains(&code) => Readiness::Ready,
            Some(code) => Readiness::NotReady(code),
            None => Readiness::Unreachable,
        }
    }
}

/// `HTTP/1.1 503 Service Unavailable` -> `503`
fn parse_status(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    parts.next().filter(|v| v.starts_with("HTTP/"))?;
    parts.next()?.parse().ok()
}
