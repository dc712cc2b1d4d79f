mod backoff;
mod config;

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use irc_link::history::{self, MessageLog};
use irc_link::{Client, ClientHandle, ConnectionError, Disconnect, Message};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use crate::backoff::Backoff;
use crate::config::CliConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("irc_link=info".parse()?)
                .add_directive("irc_watch=info".parse()?),
        )
        .init();

    let cli = CliConfig::parse();
    let (mut client, messages) = Client::new(cli.client_config()?);
    let handle = client.handle();

    let registration = Arc::new(Registration::new(&cli));
    let printer = tokio::spawn(print_messages(
        messages,
        handle.clone(),
        Arc::clone(&registration),
        cli.server.clone(),
        cli.raw,
    ));

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, quitting");
            ctrl_c.quit_with(Some("Interrupted"));
        }
    });

    let mut backoff = Backoff::new(cli.max_backoff());
    loop {
        match client.connect(&cli.server).await {
            Ok(()) => {
                backoff.reset();
                registration.register(&handle).await;
                if client.wait().await == Disconnect::Quit {
                    break;
                }
            }
            Err(ConnectionError::Closed) => break,
            Err(_) => {}
        }

        let delay = backoff.next_delay();
        tracing::info!("Reconnecting to {} in {}s", cli.server, delay.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = handle.shutdown_requested() => break,
        }
    }

    // Closes the inbound queue, which ends the printer.
    drop(client);
    printer.await?;
    Ok(())
}

/// Registration details shared by the connect loop and the message printer.
///
/// The nick lives in a `watch` so a `433` retry and the next reconnect agree
/// on which nick was last offered.
struct Registration {
    nick: watch::Sender<String>,
    realname: String,
    channels: Vec<String>,
}

impl Registration {
    fn new(cli: &CliConfig) -> Self {
        Self {
            nick: watch::Sender::new(cli.nick.clone()),
            realname: cli.realname.clone(),
            channels: cli.channels.clone(),
        }
    }

    fn nick(&self) -> String {
        self.nick.borrow().clone()
    }

    async fn register(&self, handle: &ClientHandle) {
        let nick = self.nick();
        let _ = handle.write(format!("NICK {nick}")).await;
        let _ = handle.write(format!("USER {nick} 0 * :{}", self.realname)).await;
    }

    /// React to registration numerics.
    async fn handle(&self, handle: &ClientHandle, msg: &Message) {
        match msg.command.as_str() {
            // RPL_WELCOME: registration is done.
            "001" => {
                tracing::info!("Registered as {}", self.nick());
                for channel in &self.channels {
                    let _ = handle.write(format!("JOIN {channel}")).await;
                }
            }
            // ERR_NICKNAMEINUSE
            "433" => {
                self.nick.send_modify(|nick| nick.push('_'));
                let nick = self.nick();
                tracing::warn!("Nick in use, trying {nick}");
                let _ = handle.write(format!("NICK {nick}")).await;
            }
            _ => {}
        }
    }
}

/// Prints chat lines as `[server] destination <nick> text`.
struct StdoutLog;

impl MessageLog for StdoutLog {
    type Error = io::Error;

    fn log_message(
        &self,
        server: &str,
        sender_nick: &str,
        destination: &str,
        content: &str,
    ) -> Result<(), Self::Error> {
        writeln!(io::stdout().lock(), "[{server}] {destination} <{sender_nick}> {content}")
    }
}

async fn print_messages(
    mut messages: mpsc::Receiver<Message>,
    handle: ClientHandle,
    registration: Arc<Registration>,
    server: String,
    raw: bool,
) {
    while let Some(msg) = messages.recv().await {
        registration.handle(&handle, &msg).await;

        match history::record(&StdoutLog, &server, &msg) {
            Ok(true) => {}
            Ok(false) if raw => println!("{msg}"),
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to print message: {e}"),
        }
    }
    tracing::debug!("Inbound queue closed");
}
