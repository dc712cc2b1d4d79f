//! Seam for persisting forwarded messages.
//!
//! The client never stores anything itself. Consumers that keep history
//! implement [`MessageLog`] and feed inbound messages through [`record`].

use crate::irc::Message;

/// Append-only store for chat lines, keyed by server and destination.
pub trait MessageLog {
    type Error;

    fn log_message(
        &self,
        server: &str,
        sender_nick: &str,
        destination: &str,
        content: &str,
    ) -> Result<(), Self::Error>;
}

/// Log `msg` if it carries chat content (`PRIVMSG` or `NOTICE` with a
/// target and text). Returns `Ok(false)` for anything else.
pub fn record<L>(log: &L, server: &str, msg: &Message) -> Result<bool, L::Error>
where
    L: MessageLog + ?Sized,
{
    let is_chat = msg.command.eq_ignore_ascii_case("PRIVMSG")
        || msg.command.eq_ignore_ascii_case("NOTICE");
    if !is_chat {
        return Ok(false);
    }
    let Some(destination) = msg.params.first() else {
        return Ok(false);
    };
    let content = match msg.trailing.as_deref() {
        Some(text) => text,
        None => match msg.params.get(1) {
            Some(text) => text.as_str(),
            None => return Ok(false),
        },
    };

    log.log_message(server, msg.nick().unwrap_or(""), destination, content)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryLog {
        lines: Mutex<Vec<(String, String, String, String)>>,
    }

    impl MessageLog for MemoryLog {
        type Error = std::convert::Infallible;

        fn log_message(
            &self,
            server: &str,
            sender_nick: &str,
            destination: &str,
            content: &str,
        ) -> Result<(), Self::Error> {
            self.lines.lock().unwrap().push((
                server.to_string(),
                sender_nick.to_string(),
                destination.to_string(),
                content.to_string(),
            ));
            Ok(())
        }
    }

    struct FailingLog;

    impl MessageLog for FailingLog {
        type Error = &'static str;

        fn log_message(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), Self::Error> {
            Err("disk full")
        }
    }

    #[test]
    fn privmsg_and_notice_are_logged() {
        let log = MemoryLog::default();
        let privmsg = Message::parse(":nick!user@host PRIVMSG #go-nuts :message0").unwrap();
        let notice = Message::parse(":irc.server NOTICE me bare").unwrap();

        assert_eq!(record(&log, "irc.freenode.net:6667", &privmsg), Ok(true));
        assert_eq!(record(&log, "irc.freenode.net:6667", &notice), Ok(true));

        let lines = log.lines.lock().unwrap();
        assert_eq!(
            lines[0],
            (
                "irc.freenode.net:6667".to_string(),
                "nick".to_string(),
                "#go-nuts".to_string(),
                "message0".to_string()
            )
        );
        assert_eq!(lines[1].1, "irc.server");
        assert_eq!(lines[1].3, "bare");
    }

    #[test]
    fn other_commands_are_ignored() {
        let log = MemoryLog::default();
        for line in ["JOIN #chan", ":srv 001 me :Welcome", "PRIVMSG", "PRIVMSG #chan"] {
            let msg = Message::parse(line).unwrap();
            assert_eq!(record(&log, "srv", &msg), Ok(false), "{line}");
        }
        assert!(log.lines.lock().unwrap().is_empty());
    }

    #[test]
    fn log_errors_propagate() {
        let msg = Message::parse(":a PRIVMSG #b :c").unwrap();
        assert_eq!(record(&FailingLog, "srv", &msg), Err("disk full"));
    }
}
