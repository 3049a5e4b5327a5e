//! Line-oriented front end: input commands and timeline rendering.

use std::fmt::Write as _;

use hearth_proto::message::MessageId;

use crate::optimistic::{MessageKey, SendStatus, TimelineEntry};

/// A parsed line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send the text as a new message.
    Send(String),
    /// Resend a failed message.
    Retry(MessageKey),
    /// Drop a pending message without sending it.
    Drop(MessageKey),
    /// Load the previous page of history.
    Older,
    /// Replace the content of a sent message.
    Edit {
        /// Message to edit.
        id: MessageId,
        /// New content.
        content: String,
    },
    /// Delete a sent message.
    Delete(MessageId),
    /// Exit the client.
    Quit,
}

/// Error returned for input that cannot be turned into a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The line was blank.
    #[error("nothing to send")]
    Empty,
    /// The command name is not recognised.
    #[error("unknown command /{0}")]
    Unknown(String),
    /// The command is missing an argument.
    #[error("usage: {0}")]
    Usage(&'static str),
}

impl Command {
    /// Parses one input line.
    ///
    /// Lines starting with `/` are commands; `//` escapes a literal slash.
    /// Anything else is message text.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] for blank lines, unknown commands and
    /// commands missing their argument.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(CommandError::Empty);
        }
        if let Some(text) = line.strip_prefix("//") {
            return Ok(Self::Send(format!("/{text}")));
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(Self::Send(line.to_string()));
        };

        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(name, rest)| (name, rest.trim()));
        match name {
            "retry" => first_word(rest)
                .map(|key| Self::Retry(MessageKey::new(key)))
                .ok_or(CommandError::Usage("/retry <key>")),
            "drop" => first_word(rest)
                .map(|key| Self::Drop(MessageKey::new(key)))
                .ok_or(CommandError::Usage("/drop <key>")),
            "delete" => first_word(rest)
                .map(|id| Self::Delete(MessageId::new(id)))
                .ok_or(CommandError::Usage("/delete <id>")),
            "edit" => {
                let (id, content) = rest
                    .split_once(char::is_whitespace)
                    .map(|(id, content)| (id, content.trim()))
                    .filter(|(_, content)| !content.is_empty())
                    .ok_or(CommandError::Usage("/edit <id> <text>"))?;
                Ok(Self::Edit {
                    id: MessageId::new(id),
                    content: content.to_string(),
                })
            }
            "older" => Ok(Self::Older),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

fn first_word(rest: &str) -> Option<&str> {
    rest.split_whitespace().next()
}

/// Marker shown after a message for its send state.
#[must_use]
pub const fn status_symbol(status: SendStatus) -> &'static str {
    match status {
        SendStatus::Sending => "\u{22ef}",
        SendStatus::Sent => "\u{2713}",
        SendStatus::Failed => "\u{2717}",
    }
}

/// Formats an ISO-8601 timestamp in local time, or returns it unchanged
/// if it does not parse or `format` is not a valid strftime string.
#[must_use]
pub fn format_timestamp(timestamp: &str, format: &str) -> String {
    let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(timestamp) else {
        return timestamp.to_string();
    };
    let mut out = String::new();
    match write!(out, "{}", parsed.with_timezone(&chrono::Local).format(format)) {
        Ok(()) => out,
        Err(_) => timestamp.to_string(),
    }
}

/// Renders one timeline row.
///
/// ```text
/// 14:23 [srv-1] Alice: hello ✓
/// 14:24 [temp-…] Alice: hi ✗ (relay timed out)
/// ```
#[must_use]
pub fn render_entry(entry: &TimelineEntry, timestamp_format: &str) -> String {
    let body = &entry.body;
    let sender = body
        .sender
        .as_ref()
        .map_or_else(|| body.sender_id.as_str(), |p| p.display_name.as_str());

    let mut line = format!(
        "{} [{}] {}: ",
        format_timestamp(&body.created_at, timestamp_format),
        entry.key,
        sender
    );
    if body.is_deleted() {
        line.push_str("(deleted)");
    } else {
        line.push_str(&body.content);
        if body.edited_at.is_some() {
            line.push_str(" (edited)");
        }
    }
    if let Some(status) = entry.send_status {
        line.push(' ');
        line.push_str(status_symbol(status));
        if status == SendStatus::Failed {
            let reason = entry.error().unwrap_or("not sent");
            line.push_str(&format!(" ({reason}) /retry {}", entry.key));
        }
    }
    line
}

/// Renders the whole timeline, one row per line.
#[must_use]
pub fn render_timeline(entries: &[TimelineEntry], timestamp_format: &str) -> String {
    entries
        .iter()
        .map(|entry| render_entry(entry, timestamp_format))
        .collect::<Vec<_>>()
        .join("\n")
}
