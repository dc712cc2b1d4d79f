//! IRC connection lifecycle.
//!
//! This is the main entry point for SDK consumers. A [`Client`] owns at most
//! one live session at a time: it opens the socket, splits it into owned
//! halves, spawns the writer and reader loops, releases them once setup is
//! complete and joins them when the session ends. Decoded messages come out
//! of the receiver returned by [`Client::new`]; lines go in through a
//! [`ClientHandle`].
//!
//! ## Reconnection
//!
//! The client never reconnects on its own. When a session dies,
//! [`Client::wait`] returns [`Disconnect::Lost`] (and the session's reconnect
//! signal fires once); the caller decides whether and when to call
//! [`Client::connect`] again.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;

use crate::irc::Message;
use crate::session::{self, Link, Reconnect};
use crate::transport::{self, ConnectionError, EstablishedConnection, Socket};
use crate::{reader, writer};

/// Configuration for connecting to an IRC server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Use TLS.
    pub tls: bool,
    /// Skip TLS certificate verification (for self-signed certs).
    pub tls_insecure: bool,
    /// Custom rustls configuration. Overrides `tls_insecure` when set.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Bound on DNS-to-handshake time for a single connect attempt.
    pub connect_timeout: Option<Duration>,
    /// Treat a socket silent for this long as dead.
    pub read_timeout: Option<Duration>,
    /// Outbound queue size. Writers wait when it is full.
    pub outbound_capacity: usize,
    /// Inbound message queue size.
    pub inbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tls: false,
            tls_insecure: false,
            tls_config: None,
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: None,
            outbound_capacity: 64,
            inbound_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
    /// The last session died; `connect` may be called again.
    ReconnectPending,
    /// Quit was requested and the session is flushing its queue.
    Closing,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Quit was requested. The inbound queue is closed.
    Quit,
    /// The connection failed. The client can reconnect.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("client has been shut down")]
    Closed,
}

/// A cloneable handle for sending lines and requesting shutdown from any task.
#[derive(Clone)]
pub struct ClientHandle {
    outbound: mpsc::Sender<String>,
    quit: CancellationToken,
    quit_once: Arc<Once>,
    live: watch::Receiver<Option<CancellationToken>>,
    state: watch::Receiver<State>,
}

impl ClientHandle {
    /// Queue a raw line. CRLF is appended by the writer if missing.
    ///
    /// Waits while the outbound queue is full.
    pub async fn write(&self, line: impl Into<String>) -> Result<(), SendError> {
        if self.quit.is_cancelled() {
            return Err(SendError::Closed);
        }
        tokio::select! {
            _ = self.quit.cancelled() => Err(SendError::Closed),
            sent = self.outbound.send(line.into()) => sent.map_err(|_| SendError::Closed),
        }
    }

    /// Queue a formatted line: `handle.writef(format_args!("PRIVMSG {target} :{text}"))`.
    pub fn writef(
        &self,
        args: fmt::Arguments<'_>,
    ) -> impl Future<Output = Result<(), SendError>> + '_ {
        self.write(fmt::format(args))
    }

    /// Queue a structured message.
    pub async fn send(&self, msg: &Message) -> Result<(), SendError> {
        self.write(msg.to_string()).await
    }

    /// Disconnect gracefully. See [`ClientHandle::quit_with`].
    pub fn quit(&self) {
        self.quit_with(None)
    }

    /// Queue `QUIT [:reason]` if connected, then trigger shutdown.
    ///
    /// Safe to call when not connected and safe to call repeatedly, from any
    /// number of tasks; only the first call has an effect.
    pub fn quit_with(&self, reason: Option<&str>) {
        self.quit_once.call_once(|| {
            if self.connected() {
                let msg = match reason {
                    Some(reason) => Message::new("QUIT", vec![]).with_trailing(reason),
                    None => Message::new("QUIT", vec![]),
                };
                if self.outbound.try_send(msg.to_string()).is_err() {
                    tracing::debug!("Outbound queue full, quitting without QUIT line");
                }
            }
            self.quit.cancel();
        });
    }

    /// True while a session is live and neither quit nor a failure has ended it.
    pub fn connected(&self) -> bool {
        self.live
            .borrow()
            .as_ref()
            .is_some_and(|session| !session.is_cancelled())
    }

    /// Current lifecycle state. Shows [`State::Closing`] while a quitting
    /// session flushes and winds down.
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub fn is_shut_down(&self) -> bool {
        self.quit.is_cancelled()
    }

    /// Resolves once quit has been requested.
    pub async fn shutdown_requested(&self) {
        self.quit.cancelled().await
    }
}

struct Session {
    cancel: CancellationToken,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Session {
    /// Wait for both loops. Whichever ends first takes the other down.
    async fn join(self, server: &str) {
        let Session {
            cancel,
            writer,
            reader,
        } = self;
        let writer_cancel = cancel.clone();
        let writer = async move {
            let result = writer.await;
            writer_cancel.cancel();
            result
        };
        let reader = async move {
            let result = reader.await;
            cancel.cancel();
            result
        };
        let (writer, reader) = tokio::join!(writer, reader);
        if let Err(e) = writer {
            tracing::error!(%server, "Writer task failed: {e}");
        }
        if let Err(e) = reader {
            tracing::error!(%server, "Reader task failed: {e}");
        }
    }
}

/// IRC client connection manager.
pub struct Client {
    config: ClientConfig,
    host: Option<String>,
    server_addr: Option<String>,
    state: watch::Sender<State>,
    handle: ClientHandle,
    live: watch::Sender<Option<CancellationToken>>,
    outbound: Arc<Mutex<mpsc::Receiver<String>>>,
    /// `None` once the inbound queue has been closed.
    inbound: Option<mpsc::Sender<Message>>,
    session: Option<Session>,
    reconnect: Option<mpsc::Receiver<Reconnect>>,
}

impl Client {
    /// Create a disconnected client and the receiver for decoded messages.
    pub fn new(config: ClientConfig) -> (Self, mpsc::Receiver<Message>) {
        let (out_tx, out_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (live, live_rx) = watch::channel(None);
        let (state, state_rx) = watch::channel(State::Disconnected);

        let handle = ClientHandle {
            outbound: out_tx,
            quit: CancellationToken::new(),
            quit_once: Arc::new(Once::new()),
            live: live_rx,
            state: state_rx,
        };

        let client = Self {
            config,
            host: None,
            server_addr: None,
            state,
            handle,
            live,
            outbound: Arc::new(Mutex::new(out_rx)),
            inbound: Some(in_tx),
            session: None,
            reconnect: None,
        };
        (client, in_rx)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Host of the last successful connection, without port.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// `host:port` of the last successful connection.
    pub fn server_addr(&self) -> Option<&str> {
        self.server_addr.as_deref()
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn connected(&self) -> bool {
        self.handle.connected()
    }

    pub async fn write(&self, line: impl Into<String>) -> Result<(), SendError> {
        self.handle.write(line).await
    }

    pub fn writef(
        &self,
        args: fmt::Arguments<'_>,
    ) -> impl Future<Output = Result<(), SendError>> + '_ {
        self.handle.writef(args)
    }

    pub fn quit(&self) {
        self.handle.quit()
    }

    pub fn quit_with(&self, reason: Option<&str>) {
        self.handle.quit_with(reason)
    }

    /// Take the current session's reconnect signal.
    ///
    /// Yields one [`Reconnect`] if the session dies unexpectedly, then `None`
    /// once both loops have exited.
    pub fn take_reconnect(&mut self) -> Option<mpsc::Receiver<Reconnect>> {
        self.reconnect.take()
    }

    /// Open a socket to `address` and start a session on it.
    ///
    /// The default port (6667, or 6697 with TLS) is applied when `address`
    /// has none. Makes exactly one attempt.
    pub async fn connect(&mut self, address: &str) -> Result<(), ConnectionError> {
        let inbound = self.prepare().await?;
        self.state.send_replace(State::Connecting);

        let conn = match transport::connect(&self.config, address).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Connect to {address} failed: {e}");
                self.state.send_replace(State::Disconnected);
                return Err(e);
            }
        };
        if self.handle.is_shut_down() {
            // Quit raced the dial; the socket is dropped unused.
            self.close();
            return Err(ConnectionError::Closed);
        }

        let EstablishedConnection {
            host,
            server_addr,
            socket,
        } = conn;
        match socket {
            Socket::Plain(tcp) => self.start(tcp, host, server_addr, inbound),
            Socket::Tls(tls) => self.start(*tls, host, server_addr, inbound),
        }
        Ok(())
    }

    /// Start a session on an already established stream.
    pub async fn attach<S>(
        &mut self,
        stream: S,
        host: &str,
        server_addr: &str,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let inbound = self.prepare().await?;
        self.start(stream, host.to_string(), server_addr.to_string(), inbound);
        Ok(())
    }

    /// Wait for the current session to end and settle the client's state.
    ///
    /// With no live session this resolves once quit is requested.
    pub async fn wait(&mut self) -> Disconnect {
        match self.session.take() {
            Some(session) => {
                let server = self.server_addr.clone().unwrap_or_default();
                let join = session.join(&server);
                tokio::pin!(join);
                let quit_first = tokio::select! {
                    biased;
                    _ = &mut join => false,
                    _ = self.handle.shutdown_requested() => true,
                };
                if quit_first {
                    self.state.send_replace(State::Closing);
                    join.await;
                }
            }
            None if self.inbound.is_some() => self.handle.shutdown_requested().await,
            None => {}
        }
        self.live.send_replace(None);

        if self.handle.is_shut_down() {
            self.close();
            Disconnect::Quit
        } else {
            self.state.send_replace(State::ReconnectPending);
            Disconnect::Lost
        }
    }

    /// Check a new session may start, reaping a dead one first.
    async fn prepare(&mut self) -> Result<mpsc::Sender<Message>, ConnectionError> {
        if self.handle.is_shut_down() {
            return Err(ConnectionError::Closed);
        }
        let inbound = self.inbound.clone().ok_or(ConnectionError::Closed)?;
        if let Some(ref session) = self.session {
            if !session.cancel.is_cancelled() {
                let server = self.server_addr.clone().unwrap_or_default();
                return Err(ConnectionError::AlreadyConnected(server));
            }
            self.wait().await;
        }
        Ok(inbound)
    }

    fn start<S>(
        &mut self,
        stream: S,
        host: String,
        server_addr: String,
        inbound: mpsc::Sender<Message>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let gate = self.spawn_session(stream, &server_addr, inbound);
        tracing::info!(server = %server_addr, "Connected");
        self.host = Some(host);
        self.server_addr = Some(server_addr);
        self.state.send_replace(State::Connected);
        gate.release();
    }

    /// Spawn both loops behind a readiness gate that has not been released.
    fn spawn_session<S>(
        &mut self,
        stream: S,
        server_addr: &str,
        inbound: mpsc::Sender<Message>,
    ) -> session::ReadyGate
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (gate, ready) = session::ready_gate();
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let link = Link::new(server_addr, &self.handle.quit, ready, reconnect_tx);
        let cancel = link.cancel.clone();

        let writer = tokio::spawn(writer::run(
            write_half,
            Arc::clone(&self.outbound),
            link.clone(),
        ));
        let reader = tokio::spawn(reader::run(
            BufReader::new(read_half),
            self.handle.outbound.clone(),
            inbound,
            link,
            self.config.read_timeout,
        ));

        self.live.send_replace(Some(cancel.clone()));
        self.reconnect = Some(reconnect_rx);
        self.session = Some(Session {
            cancel,
            writer,
            reader,
        });
        gate
    }

    /// Terminal shutdown: close the inbound queue (once) and drop an unread
    /// reconnect signal.
    fn close(&mut self) {
        self.reconnect = None;
        if self.inbound.take().is_some() {
            tracing::info!("Client closed");
        }
        self.state.send_replace(State::Disconnected);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.handle.quit.cancel();
    }
}
