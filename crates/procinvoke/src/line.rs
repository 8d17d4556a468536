//! Output records

use std::fmt;
use std::os::fd::RawFd;

use crate::error::{InvocationError, Result};

pub const STDIN_FD: RawFd = 0;
pub const STDOUT_FD: RawFd = 1;
pub const STDERR_FD: RawFd = 2;

/// One delimited chunk of output
///
/// `fd` is the caller-facing stream identity: captured stdout/stderr report
/// 1 and 2 even though they are read from internal pipes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawLine {
    pub line: Vec<u8>,
    /// Delimiter that ended the line; empty at end of stream
    pub eol: Vec<u8>,
    pub fd: RawFd,
}

impl RawLine {
    pub fn new(line: impl Into<Vec<u8>>, eol: impl Into<Vec<u8>>, fd: RawFd) -> Self {
        Self {
            line: line.into(),
            eol: eol.into(),
            fd,
        }
    }

    pub fn is_stdout(&self) -> bool {
        self.fd == STDOUT_FD
    }

    pub fn is_stderr(&self) -> bool {
        self.fd == STDERR_FD
    }

    pub fn line_str(&self) -> Result<&str> {
        decode(&self.line)
    }

    pub fn eol_str(&self) -> Result<&str> {
        decode(&self.eol)
    }

    /// The line as text, or its hex dump when it is not UTF-8
    pub fn line_or_hex(&self) -> String {
        text_or_hex(&self.line)
    }

    pub fn eol_or_hex(&self) -> String {
        text_or_hex(&self.eol)
    }

    /// The whole record, line then eol
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.line.len() + self.eol.len());
        bytes.extend_from_slice(&self.line);
        bytes.extend_from_slice(&self.eol);
        bytes
    }

    pub fn to_line(&self) -> Result<Line> {
        Ok(Line {
            line: self.line_str()?.to_owned(),
            eol: self.eol_str()?.to_owned(),
            fd: self.fd,
        })
    }
}

impl fmt::Display for RawLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawLine<{}, 0x{}, 0x{}>", self.fd, hex(&self.line), hex(&self.eol))
    }
}

/// A decoded [`RawLine`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Line {
    pub line: String,
    pub eol: String,
    pub fd: RawFd,
}

impl Line {
    pub fn new(line: impl Into<String>, eol: impl Into<String>, fd: RawFd) -> Self {
        Self {
            line: line.into(),
            eol: eol.into(),
            fd,
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Line<{}, \"{}\", \"{}\">",
            self.fd,
            self.line.escape_debug(),
            self.eol.escape_debug()
        )
    }
}

fn decode(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|_| InvocationError::InvalidEncoding(bytes.to_vec()))
}

fn text_or_hex(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_owned(),
        Err(_) => format!("0x{}", hex(bytes)),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
