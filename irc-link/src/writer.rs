//! Outbound loop: the only task that writes to the socket.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::session::Link;

/// Upper bound on flushing queued lines once quit has been requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Drain `queue` onto `writer` in submission order until the session ends.
///
/// The queue outlives the session: it is locked for the duration of the loop
/// and whatever is still in it after a connection loss is sent by the next
/// session. On a write failure the lines queued at that moment are dropped.
pub(crate) async fn run<W>(
    mut writer: W,
    queue: Arc<Mutex<mpsc::Receiver<String>>>,
    mut link: Link,
) where
    W: AsyncWrite + Unpin,
{
    let mut queue = queue.lock().await;
    if !link.ready().await {
        return;
    }

    loop {
        let line = tokio::select! {
            biased;
            _ = link.cancel.cancelled() => break,
            line = queue.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        // A line is never cut short by quit: the server would read the
        // next queued line glued onto the partial one.
        let written = {
            let write = write_line(&mut writer, &link.server, &line);
            tokio::pin!(write);
            let written = tokio::select! {
                biased;
                written = &mut write => Some(written),
                _ = link.cancel.cancelled() => None,
            };
            match written {
                Some(written) => Some(written),
                None if link.quit.is_cancelled() => {
                    tokio::time::timeout(DRAIN_TIMEOUT, write).await.ok()
                }
                None => None,
            }
        };
        let Some(written) = written else {
            if link.quit.is_cancelled() {
                tracing::warn!(server = %link.server, "Timed out finishing a line on quit");
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, writer.shutdown()).await;
            }
            return;
        };
        if let Err(e) = written {
            link.lost(&format!("write failed: {e}"));
            let mut dropped = 0usize;
            while queue.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                tracing::warn!(server = %link.server, "Dropped {dropped} queued lines");
            }
            return;
        }
    }

    if link.quit.is_cancelled() {
        let drain = async {
            while let Ok(line) = queue.try_recv() {
                if write_line(&mut writer, &link.server, &line).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!(server = %link.server, "Timed out flushing queued lines on quit");
        }
    }
}

/// Write one line, normalizing its terminator to CRLF.
async fn write_line<W>(writer: &mut W, server: &str, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = line.trim_end_matches(['\r', '\n']);
    tracing::debug!(%server, "-> {line}");
    writer.write_all(format!("{line}\r\n").as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{self, Reconnect};
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        tx: mpsc::Sender<String>,
        queue: Arc<Mutex<mpsc::Receiver<String>>>,
        link: Link,
        gate: session::ReadyGate,
        reconnect: mpsc::Receiver<Reconnect>,
        quit: CancellationToken,
    }

    fn harness() -> Harness {
        let (tx, rx) = mpsc::channel(16);
        let quit = CancellationToken::new();
        let (gate, ready) = session::ready_gate();
        let (reconnect_tx, reconnect) = mpsc::channel(1);
        Harness {
            tx,
            queue: Arc::new(Mutex::new(rx)),
            link: Link::new("test:6667", &quit, ready, reconnect_tx),
            gate,
            reconnect,
            quit,
        }
    }

    /// Writer that fails every write.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            std::task::Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn writes_in_order_with_crlf() {
        let h = harness();
        let (client, mut server) = tokio::io::duplex(1024);
        let task = tokio::spawn(run(client, Arc::clone(&h.queue), h.link.clone()));
        h.gate.release();

        h.tx.send("test".to_string()).await.unwrap();
        h.tx.send(format!("test {}", 2)).await.unwrap();
        h.tx.send("already\r\n".to_string()).await.unwrap();

        let expected = "test\r\ntest 2\r\nalready\r\n";
        let mut buf = vec![0u8; expected.len()];
        timeout(Duration::from_secs(1), server.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);

        h.quit.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn nothing_written_before_release() {
        let h = harness();
        let (client, mut server) = tokio::io::duplex(1024);
        let _task = tokio::spawn(run(client, Arc::clone(&h.queue), h.link.clone()));
        h.tx.send("early".to_string()).await.unwrap();

        let mut buf = [0u8; 16];
        assert!(timeout(Duration::from_millis(50), server.read(&mut buf)).await.is_err());

        h.gate.release();
        let n = timeout(Duration::from_secs(1), server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"early\r\n");
    }

    #[tokio::test]
    async fn quit_flushes_queue_then_shuts_down() {
        let h = harness();
        let (client, mut server) = tokio::io::duplex(1024);
        let task = tokio::spawn(run(client, Arc::clone(&h.queue), h.link.clone()));
        h.gate.release();

        h.tx.send("PING :x".to_string()).await.unwrap();
        let mut buf = [0u8; 9];
        timeout(Duration::from_secs(1), server.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();

        // Enqueue and quit without yielding: the writer sees quit first.
        h.tx.try_send("PRIVMSG #a :last words".to_string()).unwrap();
        h.tx.try_send("QUIT".to_string()).unwrap();
        h.quit.cancel();

        let mut rest = String::new();
        timeout(Duration::from_secs(1), server.read_to_string(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rest, "PRIVMSG #a :last words\r\nQUIT\r\n");
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn quit_mid_line_finishes_the_line_first() {
        let h = harness();
        let (client, mut server) = tokio::io::duplex(8);
        let task = tokio::spawn(run(client, Arc::clone(&h.queue), h.link.clone()));
        h.gate.release();

        // The pipe holds 8 bytes, so the writer stalls partway through.
        h.tx.send("PRIVMSG #chan :a fairly long message".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.tx.try_send("QUIT".to_string()).unwrap();
        h.quit.cancel();

        let mut wire = String::new();
        timeout(Duration::from_secs(1), server.read_to_string(&mut wire))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wire, "PRIVMSG #chan :a fairly long message\r\nQUIT\r\n");
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn loss_mid_line_abandons_without_draining() {
        let h = harness();
        let (client, mut server) = tokio::io::duplex(8);
        let task = tokio::spawn(run(client, Arc::clone(&h.queue), h.link.clone()));
        h.gate.release();

        h.tx.send("PRIVMSG #chan :a fairly long message".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.tx.try_send("NEXT".to_string()).unwrap();
        h.link.lost("read failed");
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        let mut wire = Vec::new();
        timeout(Duration::from_secs(1), server.read_to_end(&mut wire))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wire.len(), 8);
        // Left for the next session.
        assert_eq!(h.queue.lock().await.try_recv().as_deref(), Ok("NEXT"));
    }

    #[tokio::test]
    async fn quit_before_release_writes_nothing() {
        let h = harness();
        let (client, mut server) = tokio::io::duplex(1024);
        h.tx.send("NICK early".to_string()).await.unwrap();
        h.quit.cancel();

        let task = tokio::spawn(run(client, Arc::clone(&h.queue), h.link.clone()));
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        // The write half was dropped without a byte written.
        let mut rest = Vec::new();
        timeout(Duration::from_secs(1), server.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn write_failure_signals_reconnect_and_drops_queue() {
        let mut h = harness();
        h.tx.send("one".to_string()).await.unwrap();
        h.tx.send("two".to_string()).await.unwrap();
        h.tx.send("three".to_string()).await.unwrap();

        let task = tokio::spawn(run(BrokenPipe, Arc::clone(&h.queue), h.link.clone()));
        h.gate.release();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert!(h.link.cancel.is_cancelled());
        drop(h.link);
        assert_eq!(h.reconnect.recv().await, Some(Reconnect));
        assert_eq!(h.reconnect.recv().await, None);
        assert!(h.queue.lock().await.try_recv().is_err());
    }
}
