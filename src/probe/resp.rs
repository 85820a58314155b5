//! Redis request framing.
//!
//! Only enough of the wire protocol to extract the command and its first
//! argument from a client request stream: inline requests (a single
//! CRLF-terminated line) and RESP arrays of bulk strings. Replies are never
//! parsed; the probe only sees the client-to-server direction.

/// One framed Redis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command name as it appeared on the wire (case preserved).
    pub command: String,

    /// First argument (the key for most commands), empty if absent.
    pub first_arg: String,
}

/// Outcome of attempting to frame the front of a reassembly buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameResult {
    /// A complete request occupied `consumed` bytes at the front of the
    /// buffer. `frame` is `None` for empty inline lines, which frame but
    /// carry no command.
    Complete {
        frame: Option<Frame>,
        consumed: usize,
    },

    /// More bytes are needed; leave the buffer untouched.
    Incomplete,

    /// The buffer does not start with a well-formed request. The flow cannot
    /// be resynchronized and should be dropped at eviction.
    Invalid,
}

/// Try to frame one request at the front of `buf`.
pub fn parse_frame(buf: &[u8]) -> FrameResult {
    if buf.is_empty() {
        return FrameResult::Incomplete;
    }

    if buf[0] == b'*' {
        parse_array(buf)
    } else {
        parse_inline(buf)
    }
}

/// Inline request: one CRLF-terminated line, whitespace-tokenized.
fn parse_inline(buf: &[u8]) -> FrameResult {
    let Some(end) = find_crlf(buf, 0) else {
        return FrameResult::Incomplete;
    };

    let line = String::from_utf8_lossy(&buf[..end]);
    let mut tokens = line.split_whitespace();

    let frame = tokens.next().map(|command| Frame {
        command: command.to_string(),
        first_arg: tokens.next().unwrap_or("").to_string(),
    });

    FrameResult::Complete {
        frame,
        consumed: end + 2,
    }
}

/// RESP array request: `*N\r\n` followed by N bulk strings.
fn parse_array(buf: &[u8]) -> FrameResult {
    let Some(header_end) = find_crlf(buf, 1) else {
        return FrameResult::Incomplete;
    };

    let Some(count) = parse_len(&buf[1..header_end]) else {
        return FrameResult::Invalid;
    };

    let mut pos = header_end + 2;
    let mut command = String::new();
    let mut first_arg = String::new();

    for i in 0..count {
        match parse_bulk(buf, pos) {
            BulkResult::Complete { start, len } => {
                if i == 0 {
                    command = String::from_utf8_lossy(&buf[start..start + len]).into_owned();
                } else if i == 1 {
                    first_arg = String::from_utf8_lossy(&buf[start..start + len]).into_owned();
                }
                pos = start + len + 2;
            }
            BulkResult::Incomplete => return FrameResult::Incomplete,
            BulkResult::Invalid => return FrameResult::Invalid,
        }
    }

    FrameResult::Complete {
        frame: Some(Frame { command, first_arg }),
        consumed: pos,
    }
}

enum BulkResult {
    /// Payload occupies `buf[start..start + len]`, CRLF-terminated.
    Complete { start: usize, len: usize },
    Incomplete,
    Invalid,
}

/// Parse one `$L\r\n<L bytes>\r\n` bulk string at `pos`.
fn parse_bulk(buf: &[u8], pos: usize) -> BulkResult {
    if pos >= buf.len() {
        return BulkResult::Incomplete;
    }

    if buf[pos] != b'$' {
        return BulkResult::Invalid;
    }

    let Some(header_end) = find_crlf(buf, pos + 1) else {
        return BulkResult::Incomplete;
    };

    let Some(len) = parse_len(&buf[pos + 1..header_end]) else {
        return BulkResult::Invalid;
    };

    let start = header_end + 2;
    let end = start + len;

    // Payload plus its trailing CRLF must be fully buffered.
    if buf.len() < end + 2 {
        return BulkResult::Incomplete;
    }

    if &buf[end..end + 2] != b"\r\n" {
        return BulkResult::Invalid;
    }

    BulkResult::Complete { start, len }
}

/// Parse a non-negative decimal length. Negative or malformed lengths are
/// rejected; requests never carry null bulks.
fn parse_len(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() {
        return None;
    }

    let mut value: usize = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as usize)?;
    }

    Some(value)
}

/// Find the first CRLF at or after `from`, returning the index of the CR.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < 2 || from >= buf.len() {
        return None;
    }

    buf[from..buf.len() - 1]
        .iter()
        .zip(&buf[from + 1..])
        .position(|(&a, &b)| a == b'\r' && b == b'\n')
        .map(|i| from + i)
}
