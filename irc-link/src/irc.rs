//! IRC message codec.
//! Parses wire lines into [`Message`]s and renders them back. No I/O.
//!
//! Grammar: `[":" prefix " "] command *(" " middle) [" :" trailing]`

use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sender identity, e.g. `nick!user@host` or a server name.
    pub prefix: Option<String>,
    pub command: String,
    /// Middle parameters. Never contain spaces or start with `:`.
    pub params: Vec<String>,
    /// Final parameter introduced by `" :"`. May be empty or contain spaces.
    pub trailing: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("line has no command")]
    MissingCommand,
}

impl Message {
    /// Parse a raw IRC line. A trailing CRLF (or bare LF) is ignored.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut rest = line;

        // Prefix: :server or :nick!user@host
        let prefix = match rest.strip_prefix(':') {
            Some(stripped) => {
                let end = stripped.find(' ').ok_or(ParseError::MissingCommand)?;
                rest = &stripped[end + 1..];
                Some(stripped[..end].to_string())
            }
            None => None,
        };

        let (head, trailing) = if let Some(trailing) = rest.strip_prefix(':') {
            ("", Some(trailing))
        } else if let Some(idx) = rest.find(" :") {
            (&rest[..idx], Some(&rest[idx + 2..]))
        } else {
            (rest, None)
        };

        let mut tokens = head.split(' ').filter(|t| !t.is_empty());
        let command = tokens.next().ok_or(ParseError::MissingCommand)?;

        Ok(Message {
            prefix,
            command: command.to_string(),
            params: tokens.map(str::to_string).collect(),
            trailing: trailing.map(str::to_string),
        })
    }

    pub fn new(command: &str, params: Vec<&str>) -> Self {
        Self {
            prefix: None,
            command: command.to_string(),
            params: params.into_iter().map(|s| s.to_string()).collect(),
            trailing: None,
        }
    }

    pub fn with_trailing(mut self, trailing: &str) -> Self {
        self.trailing = Some(trailing.to_string());
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    /// Nick part of the prefix (`nick` in `nick!user@host`).
    pub fn nick(&self) -> Option<&str> {
        self.prefix.as_deref().and_then(|p| p.split('!').next())
    }

    /// The trailing parameter if present, otherwise the last middle parameter.
    pub fn last_param(&self) -> Option<&str> {
        self.trailing
            .as_deref()
            .or_else(|| self.params.last().map(|s| s.as_str()))
    }

    pub fn is_ping(&self) -> bool {
        self.command.eq_ignore_ascii_case("PING")
    }

    /// Reply to a keep-alive probe, echoing its arguments in the form received.
    pub fn pong(&self) -> Message {
        Message {
            prefix: None,
            command: "PONG".to_string(),
            params: self.params.clone(),
            trailing: self.trailing.clone(),
        }
    }

    /// Serialize with the CRLF terminator, ready for the socket.
    pub fn to_wire(&self) -> String {
        format!("{self}\r\n")
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        for param in &self.params {
            write!(f, " {param}")?;
        }
        if let Some(ref trailing) = self.trailing {
            write!(f, " :{trailing}")?;
        }
        Ok(())
    }
}
