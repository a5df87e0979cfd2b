//! Wire protocol for scan connections.
//!
//! Wire format:
//! - Command: `[n|z]<KEYWORD>[ <argument>]` terminated by `\n` (no prefix or
//!   `n`) or `\0` (`z`). Replies use the same terminator.
//! - INSTREAM body: `[4B len_be][payload]...` ended by a zero-length chunk.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use bulwark_core::Verdict;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Longest accepted command line, prefix and terminator excluded.
const MAX_LINE_LEN: usize = 4096 + 32;

/// Chunk header size: 4-byte big-endian payload length.
const CHUNK_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Newline,
    Nul,
}

impl Delimiter {
    const fn byte(self) -> u8 {
        match self {
            Self::Newline => b'\n',
            Self::Nul => b'\0',
        }
    }

    const fn prefix(self) -> u8 {
        match self {
            Self::Newline => b'n',
            Self::Nul => b'z',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Version,
    Stats,
    Reload,
    Shutdown,
    Session,
    End,
    Instream,
    Scan(PathBuf),
    ContScan(PathBuf),
    MultiScan(PathBuf),
    /// Anything else, kept verbatim for logging.
    Unknown(String),
}

impl Command {
    /// Parse one command line. Keywords are case-sensitive.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let (keyword, argument) = match line.split_once(' ') {
            Some((k, a)) => (k, Some(a)),
            None => (line, None),
        };
        match (keyword, argument) {
            ("PING", None) => Self::Ping,
            ("VERSION", None) => Self::Version,
            ("STATS", None) => Self::Stats,
            ("RELOAD", None) => Self::Reload,
            ("SHUTDOWN", None) => Self::Shutdown,
            ("SESSION", None) => Self::Session,
            ("END", None) => Self::End,
            ("INSTREAM", None) => Self::Instream,
            ("SCAN", Some(p)) if !p.is_empty() => Self::Scan(p.into()),
            ("CONTSCAN", Some(p)) if !p.is_empty() => Self::ContScan(p.into()),
            ("MULTISCAN", Some(p)) if !p.is_empty() => Self::MultiScan(p.into()),
            _ => Self::Unknown(line.to_string()),
        }
    }

    #[must_use]
    pub const fn keyword(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Version => "VERSION",
            Self::Stats => "STATS",
            Self::Reload => "RELOAD",
            Self::Shutdown => "SHUTDOWN",
            Self::Session => "SESSION",
            Self::End => "END",
            Self::Instream => "INSTREAM",
            Self::Scan(_) => "SCAN",
            Self::ContScan(_) => "CONTSCAN",
            Self::MultiScan(_) => "MULTISCAN",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Commands that close the connection after their reply unless the
    /// connection is in a session.
    #[must_use]
    pub const fn is_single_shot(&self) -> bool {
        matches!(
            self,
            Self::Instream | Self::Scan(_) | Self::ContScan(_) | Self::MultiScan(_)
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan(p) | Self::ContScan(p) | Self::MultiScan(p) => {
                write!(f, "{} {}", self.keyword(), p.display())
            }
            Self::Unknown(line) => f.write_str(line),
            _ => f.write_str(self.keyword()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Command(Command),
    /// One INSTREAM payload chunk.
    Chunk(Bytes),
    /// Zero-length chunk: the stream is complete.
    StreamEnd,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("command line too long")]
    LineTooLong,
    #[error("INSTREAM size limit exceeded.")]
    StreamTooLarge,
    #[error("stream read timed out")]
    ReadTimeout,
    #[error("peer disconnected mid-request")]
    Disconnected,
    #[error("unexpected frame")]
    UnexpectedFrame,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Line to send the client before closing, if the peer is still there.
    #[must_use]
    pub fn client_message(&self) -> Option<String> {
        match self {
            Self::LineTooLong => Some("Command too long".into()),
            Self::StreamTooLarge => Some(self.to_string()),
            Self::ReadTimeout => Some("Stream read timeout".into()),
            Self::UnexpectedFrame => Some("Protocol error".into()),
            Self::Disconnected | Self::Io(_) => None,
        }
    }
}

/// Snapshot rendered by `STATS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub threads_live: usize,
    pub threads_max: usize,
    pub queued: usize,
    pub engines_live: usize,
    pub build_id: String,
    pub signature_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Pong,
    Version {
        build_id: String,
        signature_count: usize,
    },
    Verdict {
        target: String,
        verdict: Verdict,
    },
    Reload,
    Stats(Stats),
    UnknownCommand,
    Busy,
    Error(String),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pong => f.write_str("PONG"),
            Self::Version {
                build_id,
                signature_count,
            } => write!(f, "{build_id} {signature_count}"),
            Self::Verdict { target, verdict } => match verdict {
                Verdict::Clean => write!(f, "{target}: OK"),
                Verdict::Infected(name) => write!(f, "{target}: {name} FOUND"),
                Verdict::Error(reason) => write!(f, "{target}: {reason} ERROR"),
            },
            Self::Reload => f.write_str("RELOAD"),
            Self::Stats(s) => write!(
                f,
                "POOLS: 1\nSTATE: VALID PRIMARY\nTHREADS: live {} max {}\nQUEUE: {} items\nENGINES: live {}\nDATABASE: {} {}\nEND",
                s.threads_live, s.threads_max, s.queued, s.engines_live, s.build_id, s.signature_count
            ),
            Self::UnknownCommand => f.write_str("UNKNOWN COMMAND"),
            Self::Busy => f.write_str("Server busy ERROR"),
            Self::Error(msg) => write!(f, "{msg} ERROR"),
        }
    }
}

// ─── Tokio codec (async server) ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Command,
    Stream { received: u64 },
}

/// Codec for scan connections. Decodes command lines, or INSTREAM chunks
/// after `begin_stream`, and encodes replies with the terminator of the last
/// command seen.
#[derive(Debug)]
pub struct ScanCodec {
    mode: Mode,
    delimiter: Delimiter,
    stream_max: u64,
}

impl ScanCodec {
    #[must_use]
    pub const fn new(stream_max: u64) -> Self {
        Self {
            mode: Mode::Command,
            delimiter: Delimiter::Newline,
            stream_max,
        }
    }

    /// Switch to chunk decoding until the terminating zero-length chunk.
    pub fn begin_stream(&mut self) {
        self.mode = Mode::Stream { received: 0 };
    }

    #[must_use]
    pub const fn delimiter(&self) -> Delimiter {
        self.delimiter
    }

    fn decode_command(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };
        let delimiter = if first == b'z' {
            Delimiter::Nul
        } else {
            Delimiter::Newline
        };

        let Some(end) = src.iter().position(|&b| b == delimiter.byte()) else {
            if src.len() > MAX_LINE_LEN + 1 {
                return Err(ProtocolError::LineTooLong);
            }
            return Ok(None);
        };
        if end > MAX_LINE_LEN + 1 {
            return Err(ProtocolError::LineTooLong);
        }

        let mut line = src.split_to(end + 1);
        line.truncate(end);
        if matches!(first, b'n' | b'z') {
            line.advance(1);
        }
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        self.delimiter = delimiter;
        let command = Command::parse(&String::from_utf8_lossy(&line));
        Ok(Some(Frame::Command(command)))
    }

    fn decode_chunk(
        &mut self,
        received: u64,
        src: &mut BytesMut,
    ) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < CHUNK_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len == 0 {
            src.advance(CHUNK_HEADER_LEN);
            self.mode = Mode::Command;
            return Ok(Some(Frame::StreamEnd));
        }

        // rejected on the header alone, the payload is never read
        let total = received + u64::from(len);
        if total > self.stream_max {
            return Err(ProtocolError::StreamTooLarge);
        }

        let len = len as usize;
        if src.len() < CHUNK_HEADER_LEN + len {
            src.reserve(CHUNK_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(CHUNK_HEADER_LEN);
        let chunk = src.split_to(len).freeze();
        self.mode = Mode::Stream { received: total };
        Ok(Some(Frame::Chunk(chunk)))
    }
}

impl Decoder for ScanCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        match self.mode {
            Mode::Command => self.decode_command(src),
            Mode::Stream { received } => self.decode_chunk(received, src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        // a partial frame at EOF is a disconnect, not a protocol violation
        let frame = self.decode(src)?;
        if frame.is_none() {
            src.clear();
        }
        Ok(frame)
    }
}

impl Encoder<Reply> for ScanCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let text = item.to_string();
        dst.reserve(text.len() + 1);
        dst.put_slice(text.as_bytes());
        dst.put_u8(self.delimiter.byte());
        Ok(())
    }
}

// ─── Sync helpers (client) ──────────────────────────────────────────────────

/// Write a prefixed, terminated command.
///
/// # Errors
///
/// Returns an error if writing to the stream fails.
pub fn write_command<W: Write>(w: &mut W, command: &Command, delimiter: Delimiter) -> io::Result<()> {
    let text = command.to_string();
    let mut buf = Vec::with_capacity(text.len() + 2);
    buf.push(delimiter.prefix());
    buf.extend_from_slice(text.as_bytes());
    buf.push(delimiter.byte());
    w.write_all(&buf)?;
    w.flush()
}

/// Write one INSTREAM chunk. An empty `data` ends the stream.
///
/// # Errors
///
/// Returns an error if writing fails or `data` exceeds `u32::MAX` bytes.
pub fn write_chunk<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk too large"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(data)?;
    w.flush()
}

/// Read one reply. `Ok(None)` when the server closed the connection.
///
/// # Errors
///
/// Returns an error if reading fails.
pub fn read_reply<R: BufRead>(r: &mut R, delimiter: Delimiter) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    if r.read_until(delimiter.byte(), &mut buf)? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&delimiter.byte()) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Split a `<target>: ...` verdict line.
#[must_use]
pub fn parse_verdict(line: &str) -> Option<(String, Verdict)> {
    let (target, rest) = line.rsplit_once(": ")?;
    let verdict = if rest == "OK" {
        Verdict::Clean
    } else if let Some(name) = rest.strip_suffix(" FOUND") {
        Verdict::Infected(name.to_string())
    } else if let Some(reason) = rest.strip_suffix(" ERROR") {
        Verdict::Error(reason.to_string())
    } else {
        return None;
    };
    Some((target.to_string(), verdict))
}
