//! Blocking TCP client socket with per-connection timeouts.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, trace};

use crate::driver::status::net;
use crate::error::{DbxError, DbxResult};

pub struct Socket {
    stream: Option<TcpStream>,
    peer: String,
    timeout: u64,
}

fn transport(status: i32, message: impl Into<String>) -> DbxError {
    DbxError::Transport {
        status,
        message: message.into(),
    }
}

impl Socket {
    /// Resolve `host` and try each address in turn.
    pub fn connect(host: &str, port: u16, timeout: u64) -> DbxResult<Self> {
        let peer = format!("{}:{}", host, port);
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| {
                transport(
                    net::NOCON,
                    "Connection Error: Failed to find the Server via a DNS Lookup",
                )
            })?
            .collect();
        if addrs.is_empty() {
            return Err(transport(
                net::NOCON,
                "Connection Error: Failed to find the Server via a DNS Lookup",
            ));
        }

        let limit = Duration::from_secs(timeout.max(1));
        let mut last_error = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, limit) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(limit))?;
                    stream.set_write_timeout(Some(limit))?;
                    stream.set_nodelay(true)?;
                    debug!("Connected to {} ({})", peer, addr);
                    return Ok(Self {
                        stream: Some(stream),
                        peer,
                        timeout,
                    });
                }
                Err(e) => {
                    debug!("Cannot connect to {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        let (code, text) = last_error
            .map(|e| (e.raw_os_error().unwrap_or(0), e.to_string()))
            .unwrap_or_default();
        Err(transport(
            net::NOCON,
            format!(
                "Connection Error: Cannot Connect to Server ({}): Error Code: {} ({})",
                peer, code, text
            ),
        ))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn write(&mut self, data: &[u8]) -> DbxResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| transport(net::NOCON, "TCP Write Error: Socket is Closed"))?;
        trace!("Sending {} bytes to {}", data.len(), self.peer);
        stream
            .write_all(data)
            .and_then(|_| stream.flush())
            .map_err(|_| transport(net::ERROR, "TCP Write Error: Cannot Write Data to Server"))
    }

    /// Read exactly `len` bytes.
    pub fn read_exact(&mut self, len: usize) -> DbxResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf)?;
        trace!("Received {} bytes from {}", len, self.peer);
        Ok(buf)
    }

    /// Read whatever is available, at most `max` bytes.
    pub fn read_some(&mut self, max: usize) -> DbxResult<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = self.read_into(&mut buf)?;
        buf.truncate(n);
        trace!("Received {} bytes from {}", n, self.peer);
        Ok(buf)
    }

    fn fill(&mut self, buf: &mut [u8]) -> DbxResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read_into(&mut buf[filled..])?;
        }
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> DbxResult<usize> {
        let timeout = self.timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| transport(net::NOCON, "TCP Read Error: Socket is Closed"))?;
        loop {
            match stream.read(buf) {
                Ok(0) => {
                    return Err(transport(
                        net::EOF,
                        "TCP Read Error: Server closed the connection without having returned any data",
                    ))
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(transport(
                        net::TIMEOUT,
                        format!(
                            "TCP Read Error: Server did not respond within the timeout period ({} seconds)",
                            timeout
                        ),
                    ))
                }
                Err(e) => {
                    return Err(transport(net::ERROR, format!("TCP Read Error: {}", e)));
                }
            }
        }
    }

    /// Shut the connection down. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("Disconnected from {}", self.peer);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}
