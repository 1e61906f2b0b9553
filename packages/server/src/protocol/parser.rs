//! The request parser (spec §4.D): inline and multi-bulk framing over one
//! input buffer per client. Grounded on the teacher's `network/connection.rs`
//! framing-adjacent buffer ownership style — an owned cursor buffer with
//! explicit `NeedMore`/`Err` states — adapted from WebSocket framing to
//! inline/multi-bulk request framing.

use bytes::{Buf, Bytes, BytesMut};

/// 256 MiB (spec §4.D: "a request in excess of 256 MiB is a protocol error
/// causing the connection to close").
const MAX_BULK_LEN: i64 = 256 * 1024 * 1024;
/// Inline lines have no explicit length prefix; cap how much unparsed data
/// we'll buffer looking for a newline before treating it as oversized too.
const MAX_INLINE_LINE: usize = MAX_BULK_LEN as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Recoverable: reply with an error, reset the parser, keep the
    /// connection (spec §4.D, §7 "Local recovery").
    Malformed(String),
    /// Unrecoverable: the connection must be closed.
    TooLarge,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(m) => write!(f, "Protocol error: {m}"),
            ProtocolError::TooLarge => write!(f, "Protocol error: invalid bulk length"),
        }
    }
}

#[derive(Debug)]
enum NextField {
    Header,
    Payload { len: usize },
}

#[derive(Debug)]
enum State {
    Fresh,
    /// §4.D inline framing's bulk tail: the line's tokens are already
    /// parsed; `len` bytes plus a trailing CRLF remain to be read as the
    /// final argument.
    InlineAwaitingBulk { tokens: Vec<Bytes>, len: usize },
    MultiBulk { remaining: usize, args: Vec<Bytes>, next: NextField },
}

/// A per-connection request parser. Owns the unconsumed byte buffer; never
/// rescans bytes it has already validated and consumed.
pub struct Parser {
    buf: BytesMut,
    state: State,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    #[must_use]
    pub fn new() -> Self {
        Self { buf: BytesMut::new(), state: State::Fresh }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Drops all buffered and in-progress parse state, keeping the
    /// connection open (spec §7 "parser errors reset the parser state").
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = State::Fresh;
    }

    /// Finds the offset of the first `\n` in `buf`, or `None`.
    fn find_newline(buf: &[u8]) -> Option<usize> {
        buf.iter().position(|&b| b == b'\n')
    }

    /// Splits `line` (already newline-stripped) into whitespace-separated
    /// tokens, each an owned `Bytes`.
    fn tokenize(line: &[u8]) -> Vec<Bytes> {
        line.split(|&b| b == b' ')
            .filter(|tok| !tok.is_empty())
            .map(Bytes::copy_from_slice)
            .collect()
    }

    fn parse_len_line(line: &[u8], prefix: u8) -> Result<i64, ProtocolError> {
        if line.first() != Some(&prefix) {
            return Err(ProtocolError::Malformed(format!("expected '{}'", prefix as char)));
        }
        std::str::from_utf8(&line[1..])
            .ok()
            .and_then(|s| s.trim_end_matches('\r').parse::<i64>().ok())
            .ok_or_else(|| ProtocolError::Malformed("invalid length".into()))
    }

    /// Attempts to parse exactly one complete request. `is_bulk_command`
    /// tells the inline path whether a command's final argument is framed
    /// as a trailing length-prefixed bulk payload (spec §4.D inline
    /// framing) rather than as a plain inline token.
    pub fn next_request(
        &mut self,
        is_bulk_command: impl Fn(&[u8]) -> bool,
    ) -> Result<Option<Vec<Bytes>>, ProtocolError> {
        loop {
            match &mut self.state {
                State::Fresh => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    if self.buf[0] == b'*' {
                        let Some(nl) = Self::find_newline(&self.buf) else {
                            if self.buf.len() > MAX_INLINE_LINE {
                                return Err(ProtocolError::TooLarge);
                            }
                            return Ok(None);
                        };
                        let line_end = if nl > 0 && self.buf[nl - 1] == b'\r' { nl - 1 } else { nl };
                        let count = Self::parse_len_line(&self.buf[..line_end], b'*')?;
                        self.buf.advance(nl + 1);
                        if count < 0 {
                            return Err(ProtocolError::Malformed("negative multibulk count".into()));
                        }
                        if count == 0 {
                            return Ok(Some(Vec::new()));
                        }
                        self.state = State::MultiBulk {
                            remaining: count as usize,
                            args: Vec::with_capacity(count as usize),
                            next: NextField::Header,
                        };
                    } else {
                        let Some(nl) = Self::find_newline(&self.buf) else {
                            if self.buf.len() > MAX_INLINE_LINE {
                                return Err(ProtocolError::TooLarge);
                            }
                            return Ok(None);
                        };
                        let line_end = if nl > 0 && self.buf[nl - 1] == b'\r' { nl - 1 } else { nl };
                        let tokens = Self::tokenize(&self.buf[..line_end]);
                        let header_consumed = nl + 1;

                        let wants_bulk_tail = tokens.len() >= 2
                            && is_bulk_command(&tokens[0].to_ascii_uppercase())
                            && std::str::from_utf8(tokens.last().unwrap())
                                .ok()
                                .and_then(|s| s.parse::<i64>().ok())
                                .is_some();

                        if wants_bulk_tail {
                            let len = std::str::from_utf8(tokens.last().unwrap())
                                .unwrap()
                                .parse::<i64>()
                                .unwrap();
                            if !(0..=MAX_BULK_LEN).contains(&len) {
                                self.buf.advance(header_consumed);
                                return Err(ProtocolError::TooLarge);
                            }
                            let mut head = tokens;
                            head.pop();
                            self.buf.advance(header_consumed);
                            self.state = State::InlineAwaitingBulk { tokens: head, len: len as usize };
                        } else {
                            self.buf.advance(header_consumed);
                            return Ok(Some(tokens));
                        }
                    }
                }
                State::InlineAwaitingBulk { len, .. } => {
                    let need = *len + 2;
                    // Exact-fit case (spec §9 Open Questions): `need` bytes
                    // already fully buffered, including the trailing CRLF,
                    // with nothing else queued behind them — this branch
                    // (not a separate fast path) is what makes that case
                    // correct, since we only ever check `>=` on the whole
                    // buffer.
                    if self.buf.len() < need {
                        return Ok(None);
                    }
                    let State::InlineAwaitingBulk { mut tokens, len } = std::mem::replace(&mut self.state, State::Fresh)
                    else {
                        unreachable!("just matched this arm");
                    };
                    let payload = self.buf.split_to(len);
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ProtocolError::Malformed("missing CRLF after bulk payload".into()));
                    }
                    self.buf.advance(2);
                    tokens.push(payload.freeze());
                    return Ok(Some(tokens));
                }
                State::MultiBulk { remaining, args, next } => {
                    if *remaining == 0 {
                        let State::MultiBulk { args, .. } = std::mem::replace(&mut self.state, State::Fresh) else {
                            unreachable!("just matched this arm");
                        };
                        return Ok(Some(args));
                    }
                    match next {
                        NextField::Header => {
                            let Some(nl) = Self::find_newline(&self.buf) else {
                                return Ok(None);
                            };
                            let line_end = if nl > 0 && self.buf[nl - 1] == b'\r' { nl - 1 } else { nl };
                            let len = Self::parse_len_line(&self.buf[..line_end], b'$')?;
                            self.buf.advance(nl + 1);
                            if !(0..=MAX_BULK_LEN).contains(&len) {
                                return Err(ProtocolError::TooLarge);
                            }
                            *next = NextField::Payload { len: len as usize };
                        }
                        NextField::Payload { len } => {
                            let need = *len + 2;
                            if self.buf.len() < need {
                                return Ok(None);
                            }
                            let payload = self.buf.split_to(*len);
                            if &self.buf[..2] != b"\r\n" {
                                return Err(ProtocolError::Malformed("missing CRLF after bulk payload".into()));
                            }
                            self.buf.advance(2);
                            args.push(payload.freeze());
                            *remaining -= 1;
                            *next = NextField::Header;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_bulk(_: &[u8]) -> bool {
        false
    }

    fn only_set(cmd: &[u8]) -> bool {
        cmd.eq_ignore_ascii_case(b"SET")
    }

    #[test]
    fn multibulk_ping() {
        let mut p = Parser::new();
        p.feed(b"*1\r\n$4\r\nPING\r\n");
        let req = p.next_request(no_bulk).unwrap().unwrap();
        assert_eq!(req, vec![Bytes::from_static(b"PING")]);
    }

    #[test]
    fn multibulk_split_across_feeds() {
        let mut p = Parser::new();
        p.feed(b"*2\r\n$3\r\nGET");
        assert_eq!(p.next_request(no_bulk).unwrap(), None);
        p.feed(b"\r\n$3\r\nfoo\r\n");
        let req = p.next_request(no_bulk).unwrap().unwrap();
        assert_eq!(req, vec![Bytes::from_static(b"GET"), Bytes::from_static(b"foo")]);
    }

    #[test]
    fn inline_simple_command() {
        let mut p = Parser::new();
        p.feed(b"PING\r\n");
        let req = p.next_request(no_bulk).unwrap().unwrap();
        assert_eq!(req, vec![Bytes::from_static(b"PING")]);
    }

    #[test]
    fn inline_bulk_tail_is_read_as_final_argument() {
        let mut p = Parser::new();
        p.feed(b"SET foo 3\r\nbar\r\n");
        let req = p.next_request(only_set).unwrap().unwrap();
        assert_eq!(
            req,
            vec![Bytes::from_static(b"SET"), Bytes::from_static(b"foo"), Bytes::from_static(b"bar")]
        );
    }

    #[test]
    fn inline_bulk_exact_fit() {
        // Buffer contains exactly header + N bytes + CRLF, nothing more —
        // the Open Question this pins down (spec §9).
        let mut p = Parser::new();
        p.feed(b"SET k 3\r\n");
        assert_eq!(p.next_request(only_set).unwrap(), None);
        p.feed(b"xyz\r\n");
        let req = p.next_request(only_set).unwrap().unwrap();
        assert_eq!(req, vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"xyz")]);
    }

    #[test]
    fn non_bulk_command_with_numeric_last_token_stays_inline() {
        let mut p = Parser::new();
        p.feed(b"EXPIRE key 100\r\n");
        let req = p.next_request(only_set).unwrap().unwrap();
        assert_eq!(
            req,
            vec![Bytes::from_static(b"EXPIRE"), Bytes::from_static(b"key"), Bytes::from_static(b"100")]
        );
    }

    #[test]
    fn oversized_multibulk_count_is_malformed() {
        let mut p = Parser::new();
        p.feed(b"*-5\r\n");
        assert!(matches!(p.next_request(no_bulk), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn oversized_bulk_length_is_fatal() {
        let mut p = Parser::new();
        p.feed(b"*1\r\n$999999999999\r\n");
        assert!(matches!(p.next_request(no_bulk), Err(ProtocolError::TooLarge)));
    }

    #[test]
    fn reset_clears_in_progress_state() {
        let mut p = Parser::new();
        p.feed(b"*2\r\n$3\r\nGET\r\n");
        assert_eq!(p.next_request(no_bulk).unwrap(), None);
        p.reset();
        p.feed(b"*1\r\n$4\r\nPING\r\n");
        let req = p.next_request(no_bulk).unwrap().unwrap();
        assert_eq!(req, vec![Bytes::from_static(b"PING")]);
    }

    #[test]
    fn empty_multibulk_is_empty_request() {
        let mut p = Parser::new();
        p.feed(b"*0\r\n");
        let req = p.next_request(no_bulk).unwrap().unwrap();
        assert!(req.is_empty());
    }
}
