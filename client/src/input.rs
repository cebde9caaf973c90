//! Terminal input: blocking prompts used before the command loop starts,
//! the stdin reader task feeding the loop, and backslash command parsing.

use std::io as stdio;
use std::io::{stdout, Write};

use tokio::io;
use tokio::sync::mpsc::{self, Receiver};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};

use protocol::FIELD_LEN;

const LINES_MAX_LEN: usize = 256;
const CHANNEL_SIZE: usize = 64;

pub const HELP: &str = "$ Commands: \\users, \\connect name, \\accept name, \\decline name, \\msg name text, \\leave name, \\quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Users,
    Connect(String),
    Accept(String),
    Decline(String),
    Msg(String, String),
    Leave(String),
    Quit,
    Help,
    Noop,
}

// blocking prompt against std::io::stdin, used only before the async loop
pub fn read_sync_user_input(prompt: &str) -> io::Result<String> {
    let mut buf = String::new();

    print!("{} ", prompt);
    stdout().flush()?; // stdout is line buffered
    stdio::stdin().read_line(&mut buf)?;

    Ok(buf.trim_end().to_owned())
}

/// Prompt until the value fits an 8-byte wire field.
pub fn read_field(prompt: &str) -> io::Result<String> {
    loop {
        let value = read_sync_user_input(prompt)?;

        if value.is_empty() || value.len() > FIELD_LEN {
            println!("Values must be 1 to {} bytes, try again", FIELD_LEN);
            continue;
        }

        return Ok(value);
    }
}

/// Feed stdin lines into a channel so the command loop can select over them.
pub fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel::<String>(CHANNEL_SIZE);

    let _h = tokio::spawn(async move {
        let mut fr = FramedRead::new(tokio::io::stdin(),
                                     LinesCodec::new_with_max_length(LINES_MAX_LEN));

        while let Some(Ok(line)) = fr.next().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });

    rx
}

pub fn parse(line: &str) -> Action {
    let line = line.trim();

    match line {
        "" => Action::Noop,
        "\\quit" => Action::Quit,
        "\\users" => Action::Users,
        "\\help" => Action::Help,
        value if value.starts_with("\\connect ") => {
            one_name(value).map_or(Action::Help, Action::Connect)
        },
        value if value.starts_with("\\accept ") => {
            one_name(value).map_or(Action::Help, Action::Accept)
        },
        value if value.starts_with("\\decline ") => {
            one_name(value).map_or(Action::Help, Action::Decline)
        },
        value if value.starts_with("\\leave ") => {
            one_name(value).map_or(Action::Help, Action::Leave)
        },
        value if value.starts_with("\\msg ") => {
            let mut parts = value.splitn(3, ' ');
            parts.next(); // the command itself

            match (parts.next(), parts.next()) {
                (Some(name), Some(text)) if !name.is_empty() && !text.trim().is_empty() => {
                    Action::Msg(name.to_owned(), text.to_owned())
                },
                _ => Action::Help,
            }
        },
        _ => Action::Help,
    }
}

fn one_name(value: &str) -> Option<String> {
    value.split_whitespace()
        .nth(1)
        .map(|name| name.to_owned())
}
