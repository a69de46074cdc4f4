//! Byte-oriented request/response transport.
//!
//! The `Transport` trait is the seam that lets the core consume a
//! byte-oriented request/response transport without owning the socket
//! directly. `TcpTransport` is the real implementation, generalized
//! from `rustradio::tcp_source::TcpSource::new` (`TcpStream::connect`,
//! blocking reads) from a streaming source into a send/recv pair with
//! full-message semantics. Tests substitute a loopback `TcpListener`
//! playing back canned bytes, the same harness `tcp_source`'s own tests
//! use.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use log::{debug, warn};

use crate::error::TransportError;

/// A transport that can send a whole request and receive a whole reply.
///
/// EtherNet/IP is strictly request/response,
/// so unlike a streaming `Read`/`Write` pair this trait works in terms of
/// complete messages, with the length-prefix handling for "how much to
/// read" left to callers that know the EtherNet/IP header format
/// (`session::Session` reads the 24-byte header first, then exactly
/// `header.length` more bytes).
pub trait Transport {
    /// Write `data` in full.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `buf.len()` bytes, blocking (subject to the
    /// transport's configured timeout) until they arrive or the
    /// connection is closed.
    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;
}

/// A blocking TCP transport, one socket per session.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to `(host, port)` and apply `timeout` to both reads and
    /// writes.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((host, port)).map_err(TransportError::Connect)?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(TransportError::Connect)?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(TransportError::Connect)?;
        stream
            .set_nodelay(true)
            .map_err(TransportError::Connect)?;
        debug!("connected to {host}:{port}");
        Ok(TcpTransport { stream })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data).map_err(TransportError::Send)
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!("connection closed while expecting {} bytes", buf.len());
                Err(TransportError::ShortRead {
                    expected: buf.len(),
                    got: 0,
                })
            }
            Err(e) => Err(TransportError::Receive(e)),
        }
    }
}

/// An in-memory transport for tests: a queue of reply buffers returned in
/// order, and a record of every request sent, so assertions can inspect
/// exactly what the engine put on the wire.
#[cfg(test)]
pub struct MockTransport {
    pub sent: Vec<Vec<u8>>,
    pub replies: std::collections::VecDeque<Vec<u8>>,
    pub recv_cursor: usize,
}

#[cfg(test)]
impl MockTransport {
    pub fn new(replies: Vec<Vec<u8>>) -> Self {
        MockTransport {
            sent: Vec::new(),
            replies: replies.into(),
            recv_cursor: 0,
        }
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.sent.push(data.to_vec());
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        loop {
            let Some(front) = self.replies.front_mut() else {
                return Err(TransportError::ShortRead {
                    expected: buf.len(),
                    got: 0,
                });
            };
            let available = front.len() - self.recv_cursor;
            if available == 0 {
                self.replies.pop_front();
                self.recv_cursor = 0;
                continue;
            }
            let n = available.min(buf.len());
            buf[..n].copy_from_slice(&front[self.recv_cursor..self.recv_cursor + n]);
            self.recv_cursor += n;
            if n < buf.len() {
                // A single queued reply didn't cover the whole read;
                // recurse to pull from the next one. Real EtherNet/IP
                // replies are never split across TCP segments in tests
                // that don't explicitly model partial reads.
                return self.recv_exact(&mut buf[n..]);
            }
            return Ok(());
        }
    }
}
