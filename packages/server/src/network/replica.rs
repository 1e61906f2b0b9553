//! Outbound replica link: the replica side of `SLAVEOF`/`SYNC` (spec §4.I
//! "Replica side").
//!
//! Grounded on the teacher's `network/connection.rs` connect-retry loop
//! shape, generalized from a single reconnect attempt to the replica
//! link's `Connect`/`Connected` cycle (`replication::ReplicaLinkState`):
//! dial the master, authenticate if configured, issue `SYNC`, load the
//! bulk snapshot it sends back, then treat everything after it as an
//! ordinary command stream applied straight to the local keyspace.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::protocol::{encode_multibulk_request, Parser};
use crate::replication::parse_bulk_preamble;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 16 * 1024;

/// Pseudo client id the replica link uses when applying the master's
/// stream to the engine — it never collides with a real connection's id
/// since those start from zero on `ConnectionRegistry::next_id`'s own
/// counter and this link lives outside the registry entirely.
const MASTER_LINK_CLIENT_ID: u64 = u64::MAX;

/// Runs the replica link until `shutdown` fires, reconnecting to
/// `(host, port)` on every drop (spec §4.I: a replica keeps retrying
/// rather than giving up).
pub async fn run(engine: EngineHandle, config: Arc<Config>, host: String, port: u16, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        match connect_and_sync(&engine, &config, &host, port, &mut shutdown).await {
            Ok(()) => {}
            Err(e) => warn!(%host, port, error = %e, "replica link dropped"),
        }
        tokio::select! {
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn connect_and_sync(
    engine: &EngineHandle,
    config: &Config,
    host: &str,
    port: u16,
    shutdown: &mut watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true).ok();
    info!(%host, port, "connecting to master");

    if let Some(pass) = &config.masterauth {
        let req = encode_multibulk_request(&[Bytes::from_static(b"AUTH"), Bytes::from(pass.clone())]);
        stream.write_all(&req).await?;
        let mut ack = [0u8; 512];
        stream.read(&mut ack).await?;
    }

    let sync_req = encode_multibulk_request(&[Bytes::from_static(b"SYNC")]);
    stream.write_all(&sync_req).await?;

    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let dump = read_bulk_preamble(&mut stream, &mut buf).await?;
    engine
        .load_snapshot(dump)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    info!(%host, port, "initial sync complete, following live stream");

    let mut parser = Parser::new();
    parser.feed(&buf);
    buf.clear();
    let mut read_buf = [0u8; READ_CHUNK];
    loop {
        while let Ok(Some(args)) = parser.next_request(crate::command::is_bulk_command) {
            if args.is_empty() {
                continue;
            }
            let name = args[0].clone();
            let rest = args[1..].to_vec();
            let _ = engine.command(MASTER_LINK_CLIENT_ID, 0, name, rest).await;
        }
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            n = stream.read(&mut read_buf) => {
                let n = n?;
                if n == 0 {
                    return Ok(());
                }
                parser.feed(&read_buf[..n]);
            }
        }
    }
}

/// Reads off the `$<n>\r\n<bytes>` preamble the master sends once the
/// snapshot is ready, returning the decoded dump. Any stream bytes read
/// past the dump (the start of the live command feed) are left in `buf`
/// for the caller to hand to its `Parser`.
async fn read_bulk_preamble(stream: &mut TcpStream, buf: &mut BytesMut) -> std::io::Result<Bytes> {
    let mut read_buf = [0u8; READ_CHUNK];
    let len = loop {
        if let Some(len) = parse_bulk_preamble(buf) {
            break len;
        }
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "master closed during preamble"));
        }
        buf.extend_from_slice(&read_buf[..n]);
    };
    while buf.len() < len {
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "master closed mid-snapshot"));
        }
        buf.extend_from_slice(&read_buf[..n]);
    }
    let dump = buf.split_to(len).freeze();
    Ok(dump)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_preamble_split_across_reads() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"$5\r\nhel");
        assert_eq!(parse_bulk_preamble(&mut buf), Some(5));
        assert_eq!(&buf[..], b"hel");
        buf.extend_from_slice(b"lo");
        assert_eq!(buf.len(), 5);
    }
}
