//! Inbound loop: the only task that reads from the socket.
//!
//! Lines are decoded with [`Message::parse`]. `PING` is answered on the
//! outbound queue and never forwarded; everything else goes to the inbound
//! queue in wire order. A malformed line is logged and skipped.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use crate::irc::{Message, ParseError};
use crate::session::Link;

pub(crate) async fn run<R>(
    mut reader: R,
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Sender<Message>,
    mut link: Link,
    read_timeout: Option<Duration>,
) where
    R: AsyncBufRead + Unpin,
{
    if !link.ready().await {
        return;
    }

    let mut buf = Vec::with_capacity(512);
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = link.cancel.cancelled() => return,
            read = read_line(&mut reader, &mut buf, read_timeout) => read,
        };
        match read {
            Ok(0) => {
                link.lost("connection closed by peer");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                link.lost(&format!("read failed: {e}"));
                return;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        tracing::debug!(server = %link.server, "<- {}", line.trim_end());

        let msg = match Message::parse(&line) {
            Ok(msg) => msg,
            Err(ParseError::Empty) => continue,
            Err(e) => {
                tracing::warn!(server = %link.server, "Discarding {:?}: {e}", line.trim_end());
                continue;
            }
        };

        if msg.is_ping() {
            let reply = msg.pong().to_string();
            tokio::select! {
                biased;
                _ = link.cancel.cancelled() => return,
                sent = outbound.send(reply) => if sent.is_err() { return },
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = link.cancel.cancelled() => return,
            sent = inbound.send(msg) => if sent.is_err() {
                tracing::debug!(server = %link.server, "Inbound receiver dropped");
            },
        }
    }
}

async fn read_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, reader.read_until(b'\n', buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?,
        None => reader.read_until(b'\n', buf).await,
    }
}
