//! Blocking client for the scan protocol.

use std::io::{self, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bulwark_core::Verdict;
use interprocess::local_socket::prelude::*;
use interprocess::local_socket::GenericFilePath;
use tracing::{debug, trace};

use crate::protocol::{self, Command, Delimiter};

/// INSTREAM chunk size used when streaming from a reader.
const CHUNK_SIZE: usize = 64 * 1024;

/// Target name the daemon uses for INSTREAM verdicts.
const STREAM_TARGET: &str = "stream";

/// Every request is sent NUL-terminated.
const DELIMITER: Delimiter = Delimiter::Nul;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Local(PathBuf),
}

enum Stream {
    Tcp(TcpStream),
    Local(interprocess::local_socket::Stream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Local(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Local(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Local(s) => s.flush(),
        }
    }
}

/// One verdict line: the target as the server names it, and its verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReply {
    pub target: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone)]
pub struct Client {
    endpoint: Endpoint,
    timeout: Duration,
}

impl Client {
    /// `timeout` bounds connecting and every read and write.
    #[must_use]
    pub const fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }

    fn connect(&self) -> io::Result<BufReader<Stream>> {
        trace!(endpoint = ?self.endpoint, "connecting");
        let stream = match &self.endpoint {
            Endpoint::Tcp(address) => {
                let mut last_err = None;
                let mut connected = None;
                for addr in address.to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, self.timeout) {
                        Ok(s) => {
                            connected = Some(s);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                let stream = connected.ok_or_else(|| {
                    last_err.unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::AddrNotAvailable, "address did not resolve")
                    })
                })?;
                stream.set_read_timeout(Some(self.timeout))?;
                stream.set_write_timeout(Some(self.timeout))?;
                Stream::Tcp(stream)
            }
            Endpoint::Local(path) => {
                let name = path
                    .as_path()
                    .to_fs_name::<GenericFilePath>()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let stream = interprocess::local_socket::Stream::connect(name)?;
                let _ = stream.set_recv_timeout(Some(self.timeout));
                let _ = stream.set_send_timeout(Some(self.timeout));
                Stream::Local(stream)
            }
        };
        Ok(BufReader::new(stream))
    }

    /// Send one command and read exactly one reply.
    fn request(&self, command: &Command) -> io::Result<String> {
        let mut conn = self.connect()?;
        protocol::write_command(conn.get_mut(), command, DELIMITER)?;
        protocol::read_reply(&mut conn, DELIMITER)?.ok_or_else(closed_early)
    }

    /// Send a single-shot scan command and read verdicts until the server closes.
    fn request_verdicts(&self, command: &Command, path: &Path) -> io::Result<Vec<ScanReply>> {
        let mut conn = self.connect()?;
        protocol::write_command(conn.get_mut(), command, DELIMITER)?;
        let mut replies = Vec::new();
        while let Some(line) = protocol::read_reply(&mut conn, DELIMITER)? {
            replies.push(parse_scan_reply(&line, &path.display().to_string())?);
        }
        debug!(command = command.keyword(), replies = replies.len(), "scan complete");
        Ok(replies)
    }

    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or does not answer `PONG`.
    pub fn ping(&self) -> io::Result<()> {
        let reply = self.request(&Command::Ping)?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(unexpected(&reply))
        }
    }

    /// `<build_id> <signature_count>` of the engine the connection bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable.
    pub fn version(&self) -> io::Result<String> {
        self.request(&Command::Version)
    }

    /// The `STATS` block, without its terminating `END` line.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable.
    pub fn stats(&self) -> io::Result<String> {
        let block = self.request(&Command::Stats)?;
        Ok(block
            .strip_suffix("END")
            .unwrap_or(&block)
            .trim_end()
            .to_string())
    }

    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or does not acknowledge.
    pub fn reload(&self) -> io::Result<()> {
        let reply = self.request(&Command::Reload)?;
        if reply == "RELOAD" {
            Ok(())
        } else {
            Err(unexpected(&reply))
        }
    }

    /// Ask the daemon to stop. Returns once the server closed the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable.
    pub fn shutdown(&self) -> io::Result<()> {
        let mut conn = self.connect()?;
        protocol::write_command(conn.get_mut(), &Command::Shutdown, DELIMITER)?;
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or replies with
    /// something other than verdict lines.
    pub fn scan(&self, path: &Path) -> io::Result<Vec<ScanReply>> {
        self.request_verdicts(&Command::Scan(path.to_path_buf()), path)
    }

    /// # Errors
    ///
    /// See [`Client::scan`].
    pub fn contscan(&self, path: &Path) -> io::Result<Vec<ScanReply>> {
        self.request_verdicts(&Command::ContScan(path.to_path_buf()), path)
    }

    /// # Errors
    ///
    /// See [`Client::scan`].
    pub fn multiscan(&self, path: &Path) -> io::Result<Vec<ScanReply>> {
        self.request_verdicts(&Command::MultiScan(path.to_path_buf()), path)
    }

    /// Stream `reader` to the daemon with INSTREAM.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the input or talking to the daemon fails,
    /// or the daemon rejects the stream.
    pub fn instream<R: Read>(&self, mut reader: R) -> io::Result<ScanReply> {
        let mut conn = self.connect()?;
        protocol::write_command(conn.get_mut(), &Command::Instream, DELIMITER)?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent = 0usize;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if let Err(e) = protocol::write_chunk(conn.get_mut(), &buf[..n]) {
                // the server may have rejected the stream and closed
                debug!(%e, sent, "stream write failed");
                break;
            }
            sent += n;
        }
        let _ = protocol::write_chunk(conn.get_mut(), &[]);

        let line = protocol::read_reply(&mut conn, DELIMITER)?.ok_or_else(closed_early)?;
        parse_scan_reply(&line, STREAM_TARGET)
    }
}

/// Parse a verdict line. A bare `<message> ERROR` from the daemon (busy,
/// size limit, shutting down) becomes an error verdict for `target`.
fn parse_scan_reply(line: &str, target: &str) -> io::Result<ScanReply> {
    if let Some((target, verdict)) = protocol::parse_verdict(line) {
        return Ok(ScanReply { target, verdict });
    }
    match line.strip_suffix(" ERROR") {
        Some(message) if !message.is_empty() => Ok(ScanReply {
            target: target.to_string(),
            verdict: Verdict::Error(message.to_string()),
        }),
        _ => Err(unexpected(line)),
    }
}

fn unexpected(reply: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("unexpected reply: {reply}"))
}

fn closed_early() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "server closed the connection without replying",
    )
}
