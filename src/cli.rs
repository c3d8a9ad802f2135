//! Interactive prompt for `tether_cli`.
//!
//! Each line is one of:
//!
//! - `.exit` to quit (end of input also quits).
//! - `.sub <command>` / `.unsub <command>` to toggle printing of pushed packets.
//! - `<command> [body]` to send a request whose body is the rest of the line.
use std::io::{self, BufRead, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("prompt IO error: {0}")]
    Io(#[from] io::Error),
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),
    #[error("'{0}' is not a command id")]
    InvalidCommandId(String),
}

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Exit,
    Request { command: i32, body: String },
    Subscribe(i32),
    Unsubscribe(i32),
}

/// Prompts for and parses one line.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CliError>
where
    R: BufRead,
    W: Write,
{
    write!(&mut writer, "> ")?;
    writer.flush()?;

    let mut line = String::default();
    if reader.read_line(&mut line)? == 0 {
        return Ok(Command::Exit);
    }
    parse(line.trim())
}

fn parse(line: &str) -> Result<Command, CliError> {
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    match head {
        ".exit" => Ok(Command::Exit),
        ".sub" => command_id(rest.trim()).map(Command::Subscribe),
        ".unsub" => command_id(rest.trim()).map(Command::Unsubscribe),
        s if s.starts_with('.') => Err(CliError::Unrecognized(s.to_string())),
        s => Ok(Command::Request {
            command: command_id(s)?,
            body: rest.to_string(),
        }),
    }
}

fn command_id(s: &str) -> Result<i32, CliError> {
    s.parse()
        .map_err(|_| CliError::InvalidCommandId(s.to_string()))
}
