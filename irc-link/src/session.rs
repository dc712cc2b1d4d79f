//! Per-connection coordination shared by the reader and writer loops.
//!
//! A session is one socket's worth of work. Both loops hold a [`Link`]: the
//! session's cancellation token (a child of the client-wide quit token), the
//! readiness gate and the sending side of the reconnect signal.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Token delivered on the reconnect signal when a live connection dies
/// unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconnect;

/// Create a readiness latch. The loops wait on [`Ready`] until the
/// coordinator calls [`ReadyGate::release`].
pub(crate) fn ready_gate() -> (ReadyGate, Ready) {
    let (tx, rx) = watch::channel(false);
    (ReadyGate(tx), Ready(rx))
}

pub(crate) struct ReadyGate(watch::Sender<bool>);

impl ReadyGate {
    pub(crate) fn release(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Clone)]
pub(crate) struct Ready(watch::Receiver<bool>);

impl Ready {
    /// Resolves `true` once released, `false` if the gate was dropped first.
    async fn wait(&mut self) -> bool {
        self.0.wait_for(|released| *released).await.is_ok()
    }
}

#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) server: Arc<str>,
    /// Cancelled on quit and on connection loss.
    pub(crate) cancel: CancellationToken,
    /// Client-wide shutdown; distinguishes intentional teardown from loss.
    pub(crate) quit: CancellationToken,
    ready: Ready,
    reconnect: mpsc::Sender<Reconnect>,
}

impl Link {
    pub(crate) fn new(
        server: &str,
        quit: &CancellationToken,
        ready: Ready,
        reconnect: mpsc::Sender<Reconnect>,
    ) -> Self {
        Self {
            server: Arc::from(server),
            cancel: quit.child_token(),
            quit: quit.clone(),
            ready,
            reconnect,
        }
    }

    /// Wait for the coordinator to finish setup. Returns `false` if the
    /// session ended before that happened. An already released gate wins, so
    /// a quit issued right after setup still lets the writer flush.
    pub(crate) async fn ready(&mut self) -> bool {
        tokio::select! {
            biased;
            released = self.ready.wait() => released,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Report an unexpected failure: raise the reconnect signal and stop the
    /// session. A no-op once the session is already cancelled, so shutdown
    /// never raises the signal and a second failure is coalesced.
    pub(crate) fn lost(&self, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::warn!(server = %self.server, "Connection lost: {reason}");
        // Capacity is one: a pending token already says everything.
        let _ = self.reconnect.try_send(Reconnect);
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> (Link, ReadyGate, mpsc::Receiver<Reconnect>, CancellationToken) {
        let quit = CancellationToken::new();
        let (gate, ready) = ready_gate();
        let (tx, rx) = mpsc::channel(1);
        (Link::new("test:6667", &quit, ready, tx), gate, rx, quit)
    }

    #[tokio::test]
    async fn lost_signals_once_then_closes() {
        let (link, _gate, mut rx, _quit) = link();
        let other = link.clone();
        link.lost("read failed");
        other.lost("write failed");
        assert!(link.cancel.is_cancelled());
        drop(link);
        drop(other);

        assert_eq!(rx.recv().await, Some(Reconnect));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn lost_after_quit_is_silent() {
        let (link, _gate, mut rx, quit) = link();
        quit.cancel();
        link.lost("socket closed");
        drop(link);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn ready_waits_for_release() {
        let (mut link, gate, _rx, _quit) = link();
        let waiter = tokio::spawn(async move { link.ready().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        gate.release();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn ready_fails_when_gate_dropped_or_quit() {
        let (mut link, gate, _rx, _quit) = link();
        drop(gate);
        assert!(!link.ready().await);

        let (mut link, _gate, _rx, quit) = self::link();
        quit.cancel();
        assert!(!link.ready().await);
    }

    #[tokio::test]
    async fn released_gate_wins_over_quit() {
        let (mut link, gate, _rx, quit) = link();
        gate.release();
        quit.cancel();
        assert!(link.ready().await);
    }
}
