//! Capture record on-disk codec.
//!
//! One LF-terminated line per observed request, 13 whitespace-separated
//! tokens. Token positions 11 and 12 (0-based) carry the command and its
//! first argument, each wrapped in ASCII double quotes; the earlier tokens
//! (timestamp, endpoints, payload length) are present for operators but
//! opaque to the analyzer. Consumers skip any line with fewer than 13 tokens.
//!
//! Redis keys are binary-safe, so whitespace, control bytes, quotes and
//! backslashes inside the quoted tokens are backslash-escaped (`\xNN` for
//! whitespace/control bytes). A record therefore always occupies exactly one
//! line and exactly 13 tokens, whatever the key contains.

use std::fs::File;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// Minimum token count for a line to be considered a record.
pub const MIN_TOKENS: usize = 13;

/// Token index of the quoted command.
pub const COMMAND_TOKEN: usize = 11;

/// Token index of the quoted first argument.
pub const FIRST_ARG_TOKEN: usize = 12;

/// One observed Redis request, as written by the probe.
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub timestamp: DateTime<Utc>,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    /// Byte length of the request frame on the wire.
    pub length: usize,
    pub command: String,
    pub first_arg: String,
}

impl CaptureRecord {
    /// Render the record as its 13-token line, without the trailing newline.
    pub fn to_line(&self) -> String {
        format!(
            "{} IP {} {} -> {} {} tcp len {} \"{}\" \"{}\"",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.6f"),
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.length,
            escape(&self.command),
            escape(&self.first_arg),
        )
    }
}

/// Escape a quoted-token value so it contains no whitespace, control bytes,
/// quotes or bare backslashes.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c if c.is_whitespace() || c.is_control() => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("\\x{b:02x}"));
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Invert [`escape`]. Unrecognized escape sequences pass through verbatim.
fn unescape(token: &str) -> String {
    fn hex_val(b: u8) -> Option<u8> {
        (b as char).to_digit(16).map(|v| v as u8)
    }

    let mut out = Vec::with_capacity(token.len());
    let mut bytes = token.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'"') => out.push(b'"'),
            Some(b'x') => {
                let hi = bytes.next();
                let lo = bytes.next();
                match (hi.and_then(hex_val), lo.and_then(hex_val)) {
                    (Some(h), Some(l)) => out.push(h << 4 | l),
                    _ => {
                        out.extend_from_slice(b"\\x");
                        out.extend(hi);
                        out.extend(lo);
                    }
                }
            }
            Some(other) => {
                out.push(b'\\');
                out.push(other);
            }
            None => out.push(b'\\'),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Appending record writer. Writes are unbuffered so that a probe killed at
/// its deadline leaves every completed record on disk.
pub struct RecordWriter {
    file: File,
}

impl RecordWriter {
    /// Create or append to the output file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening capture output {}", path.display()))?;

        Ok(Self { file })
    }

    /// Append one record, newline-terminated.
    pub fn write(&mut self, record: &CaptureRecord) -> Result<()> {
        let mut line = record.to_line();
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .context("writing capture record")
    }
}

/// The analyzer-facing view of one record line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    /// Command as written on the wire; case preserved.
    pub command: String,

    /// First argument, verbatim and case-sensitive.
    pub first_arg: String,
}

/// Parse one record line. Returns `None` for lines with fewer than 13
/// tokens; such lines are skipped by consumers.
pub fn parse_line(line: &str) -> Option<ParsedRecord> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < MIN_TOKENS {
        return None;
    }

    Some(ParsedRecord {
        command: unescape(unquote(tokens[COMMAND_TOKEN])),
        first_arg: unescape(unquote(tokens[FIRST_ARG_TOKEN])),
    })
}

/// Strip one pair of wrapping double quotes, if present.
fn unquote(token: &str) -> &str {
    token
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(token)
}
