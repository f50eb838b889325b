//! Operator command parsing for the interactive client.
//!
//! Turns raw stdin lines into structured commands. Slash commands drive the
//! file transfer queue and history replay; any line that is not a known
//! command is sent as a plain text message.

use std::path::PathBuf;

use anyhow::{Result, anyhow};

pub const HELP_TEXT: &str = "Available commands:\n\
  /file <path>     - enqueue a file to send\n\
  /queue           - show queued files and their states\n\
  /history         - list successfully sent files\n\
  /pause           - pause the file sending queue\n\
  /resume          - resume the file sending queue\n\
  /cancel <id>     - cancel a queued/sending file by id\n\
  /cancelall       - cancel ALL files and reconnect the file channel\n\
  /retry <id>      - retry a failed file by id\n\
  /sendhistory     - ask the broker to replay recent messages\n\
  /help            - show this help text\n\
  quit             - exit the program\n\
Anything else will be sent as a text message.";

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    File(PathBuf),
    Queue,
    History,
    Pause,
    Resume,
    Cancel(u64),
    CancelAll,
    Retry(u64),
    SendHistory,
    Help,
    Quit,
    Text(String),
}

impl ConsoleCommand {
    /// Parses one input line. Unknown slash commands fall through to plain
    /// text, matching the "anything else is chat" rule; known commands with
    /// malformed arguments are usage errors.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case("quit") {
            return Ok(ConsoleCommand::Quit);
        }
        if !trimmed.starts_with('/') {
            return Ok(ConsoleCommand::Text(trimmed.to_owned()));
        }

        let (command, args) = match trimmed.split_once(char::is_whitespace) {
            Some((command, args)) => (command, args.trim()),
            None => (trimmed, ""),
        };

        match command {
            "/file" => {
                if args.is_empty() {
                    return Err(anyhow!("usage: /file <path>"));
                }
                Ok(ConsoleCommand::File(PathBuf::from(args)))
            }
            "/queue" => Ok(ConsoleCommand::Queue),
            "/history" => Ok(ConsoleCommand::History),
            "/pause" => Ok(ConsoleCommand::Pause),
            "/resume" => Ok(ConsoleCommand::Resume),
            "/cancel" => parse_id(args, "/cancel").map(ConsoleCommand::Cancel),
            "/cancelall" => Ok(ConsoleCommand::CancelAll),
            "/retry" => parse_id(args, "/retry").map(ConsoleCommand::Retry),
            "/sendhistory" => Ok(ConsoleCommand::SendHistory),
            "/help" => Ok(ConsoleCommand::Help),
            _ => Ok(ConsoleCommand::Text(trimmed.to_owned())),
        }
    }
}

fn parse_id(args: &str, command: &str) -> Result<u64> {
    args.parse()
        .map_err(|_| anyhow!("invalid id for {command}. Usage: {command} <id>"))
}
