//! Wire replies (spec §6 "Wire protocol").

use bytes::{BufMut, Bytes, BytesMut};

/// One reply value. `MultiBulk(None)` and `Bulk(None)` render `*-1\r\n` and
/// `$-1\r\n` respectively — the nil forms blocking pops and missing keys use.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    MultiBulk(Option<Vec<Reply>>),
}

impl Reply {
    #[must_use]
    pub fn ok() -> Self {
        Reply::Status("OK".into())
    }

    #[must_use]
    pub fn nil() -> Self {
        Reply::Bulk(None)
    }

    #[must_use]
    pub fn nil_array() -> Self {
        Reply::MultiBulk(None)
    }

    #[must_use]
    pub fn bulk(bytes: impl Into<Bytes>) -> Self {
        Reply::Bulk(Some(bytes.into()))
    }

    #[must_use]
    pub fn array(items: Vec<Reply>) -> Self {
        Reply::MultiBulk(Some(items))
    }

    #[must_use]
    pub fn error(msg: impl Into<String>) -> Self {
        Reply::Error(msg.into())
    }

    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Reply::Status(s) => {
                out.put_u8(b'+');
                out.put_slice(s.as_bytes());
                out.put_slice(b"\r\n");
            }
            Reply::Error(e) => {
                out.put_u8(b'-');
                out.put_slice(e.as_bytes());
                out.put_slice(b"\r\n");
            }
            Reply::Integer(n) => {
                out.put_u8(b':');
                out.put_slice(n.to_string().as_bytes());
                out.put_slice(b"\r\n");
            }
            Reply::Bulk(None) => out.put_slice(b"$-1\r\n"),
            Reply::Bulk(Some(b)) => {
                out.put_u8(b'$');
                out.put_slice(b.len().to_string().as_bytes());
                out.put_slice(b"\r\n");
                out.put_slice(b);
                out.put_slice(b"\r\n");
            }
            Reply::MultiBulk(None) => out.put_slice(b"*-1\r\n"),
            Reply::MultiBulk(Some(items)) => {
                out.put_u8(b'*');
                out.put_slice(items.len().to_string().as_bytes());
                out.put_slice(b"\r\n");
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl From<bool> for Reply {
    fn from(b: bool) -> Self {
        Reply::Integer(i64::from(b))
    }
}

/// Encodes a request's arguments as a multi-bulk frame — the wire shape the
/// append-only log and the replication stream both use (spec §4.H, §6:
/// "Identical framing to client wire protocol").
#[must_use]
pub fn encode_multibulk_request(args: &[Bytes]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_u8(b'*');
    out.put_slice(args.len().to_string().as_bytes());
    out.put_slice(b"\r\n");
    for arg in args {
        out.put_u8(b'$');
        out.put_slice(arg.len().to_string().as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_encodes_plus_prefixed() {
        assert_eq!(Reply::ok().to_bytes(), Bytes::from_static(b"+OK\r\n"));
    }

    #[test]
    fn bulk_nil_is_dollar_minus_one() {
        assert_eq!(Reply::nil().to_bytes(), Bytes::from_static(b"$-1\r\n"));
    }

    #[test]
    fn array_nil_is_star_minus_one() {
        assert_eq!(Reply::nil_array().to_bytes(), Bytes::from_static(b"*-1\r\n"));
    }

    #[test]
    fn bulk_round_trips_binary_safe_bytes() {
        let r = Reply::bulk(Bytes::from_static(b"bar"));
        assert_eq!(r.to_bytes(), Bytes::from_static(b"$3\r\nbar\r\n"));
    }

    #[test]
    fn nested_multibulk_matches_exec_reply_shape() {
        let r = Reply::array(vec![Reply::ok(), Reply::Integer(2)]);
        assert_eq!(r.to_bytes(), Bytes::from_static(b"*2\r\n+OK\r\n:2\r\n"));
    }

    #[test]
    fn multibulk_request_framing_matches_aof_wire_shape() {
        let args = vec![Bytes::from_static(b"SET"), Bytes::from_static(b"a"), Bytes::from_static(b"1")];
        let framed = encode_multibulk_request(&args);
        assert_eq!(framed, Bytes::from_static(b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n"));
    }
}
