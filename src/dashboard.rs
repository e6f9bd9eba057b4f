//! # Dashboard
//!
//! A terminal chat front end for the relay backend.
//!
//! The dashboard keeps its own named sessions ([`DialogueSessions`]). Each has a
//! conversation id and a local history. Every turn is sent with the last
//! `history_len * 2` local messages and the answer is printed as it streams in.
//!
//! Lines starting with `/` are commands:
//!
//! | Command          | Effect                                              |
//! |------------------|-----------------------------------------------------|
//! | `/new [name]`    | create a session and switch to it                   |
//! | `/del [name]`    | delete a session (the last one cannot be deleted)   |
//! | `/clear [name]`  | clear a session's local history                     |
//! | `/switch <name>` | switch to another session                           |
//! | `/help`          | list the commands                                   |
//!
//! `exit` or `quit` leaves the loop.

use std::error::Error;
use std::io::{self, BufRead, Write};

use crossterm::{
    QueueableCommand,
    style::{Attribute, Color, Print, SetAttribute, SetForegroundColor},
};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::client::{ApiRequest, StreamItem};
use crate::config::RelayConfig;
use crate::repository::new_id;
use crate::schemas::ChatRequest;
use crate::template::History;

pub const DEFAULT_SESSION: &str = "default";

static COMMAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/([^\s]+)\s*(.*)$").unwrap());

const HELP: &str = "\
Commands:
  /new [name]     create a session and switch to it
  /del [name]     delete a session
  /clear [name]   clear a session's history
  /switch <name>  switch to another session
  /help           show this help
Type exit or quit to leave.";

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("session '{0}' already exists")]
    Exists(String),

    #[error("session '{0}' does not exist")]
    NotFound(String),

    #[error("this is the last session, cannot be deleted")]
    LastSession,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub name: String,
    pub conversation_id: String,
    pub history: Vec<History>,
}

impl Session {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conversation_id: new_id(),
            history: Vec::new(),
        }
    }
}

/// The dashboard's local sessions. There is always at least one.
#[derive(Debug)]
pub struct DialogueSessions {
    sessions: Vec<Session>,
    current: usize,
}

impl Default for DialogueSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl DialogueSessions {
    pub fn new() -> Self {
        Self {
            sessions: vec![Session::new(DEFAULT_SESSION)],
            current: 0,
        }
    }

    pub fn current(&self) -> &Session {
        &self.sessions[self.current]
    }

    pub fn current_mut(&mut self) -> &mut Session {
        &mut self.sessions[self.current]
    }

    pub fn names(&self) -> Vec<&str> {
        self.sessions.iter().map(|s| s.name.as_str()).collect()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.sessions.iter().position(|s| s.name == name)
    }

    fn resolve(&self, name: Option<&str>) -> Result<usize, SessionError> {
        match name {
            Some(name) => self
                .position(name)
                .ok_or_else(|| SessionError::NotFound(name.to_string())),
            None => Ok(self.current),
        }
    }

    /// Create a session and make it current.
    ///
    /// Without a name the first free `session N` is used.
    pub fn create(&mut self, name: Option<&str>) -> Result<&Session, SessionError> {
        let name = match name {
            Some(name) => {
                if self.position(name).is_some() {
                    return Err(SessionError::Exists(name.to_string()));
                }
                name.to_string()
            }
            None => {
                let mut n = self.sessions.len() + 1;
                while self.position(&format!("session {n}")).is_some() {
                    n += 1;
                }
                format!("session {n}")
            }
        };
        self.sessions.push(Session::new(name));
        self.current = self.sessions.len() - 1;
        Ok(self.current())
    }

    /// Delete a session locally and return its name; the first remaining one becomes
    /// current if the deleted session was.
    pub fn delete(&mut self, name: Option<&str>) -> Result<String, SessionError> {
        let idx = self.resolve(name)?;
        if self.sessions.len() == 1 {
            return Err(SessionError::LastSession);
        }
        let removed = self.sessions.remove(idx);
        if idx == self.current {
            self.current = 0;
        } else if idx < self.current {
            self.current -= 1;
        }
        Ok(removed.name)
    }

    pub fn clear(&mut self, name: Option<&str>) -> Result<(), SessionError> {
        let idx = self.resolve(name)?;
        self.sessions[idx].history.clear();
        Ok(())
    }

    pub fn switch(&mut self, name: &str) -> Result<(), SessionError> {
        self.current = self.resolve(Some(name))?;
        Ok(())
    }

    /// The last `history_len * 2` messages of the current session.
    pub fn recent_history(&self, history_len: i32) -> Vec<History> {
        let history = &self.current().history;
        let keep = usize::try_from(history_len.max(0)).unwrap_or(0) * 2;
        history[history.len().saturating_sub(keep)..].to_vec()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    New(Option<String>),
    Del(Option<String>),
    Clear(Option<String>),
    Switch(Option<String>),
    Help,
    Unknown(String),
}

/// One line typed by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Empty,
    Exit,
    Command(Command),
    Query(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if matches!(line.to_lowercase().as_str(), "exit" | "quit") {
        return Input::Exit;
    }
    let Some(caps) = COMMAND.captures(line) else {
        return Input::Query(line.to_string());
    };

    let arg = caps
        .get(2)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let command = match &caps[1] {
        "new" => Command::New(arg),
        "del" => Command::Del(arg),
        "clear" => Command::Clear(arg),
        "switch" => Command::Switch(arg),
        "help" => Command::Help,
        other => Command::Unknown(other.to_string()),
    };
    Input::Command(command)
}

fn say<W: Write>(out: &mut W, color: Color, text: &str) -> io::Result<()> {
    out.queue(SetForegroundColor(color))?
        .queue(Print(text))?
        .queue(Print("\n"))?
        .queue(SetForegroundColor(Color::Reset))?;
    out.flush()
}

fn apply_command<W: Write>(
    sessions: &mut DialogueSessions,
    command: Command,
    out: &mut W,
) -> io::Result<()> {
    let result = match command {
        Command::New(name) => sessions
            .create(name.as_deref())
            .map(|s| format!("Created session '{}'", s.name)),
        Command::Del(name) => sessions
            .delete(name.as_deref())
            .map(|removed| format!("Deleted session '{removed}'")),
        Command::Clear(name) => sessions
            .clear(name.as_deref())
            .map(|_| "History cleared".to_string()),
        Command::Switch(Some(name)) => sessions
            .switch(&name)
            .map(|_| format!("Switched to session '{name}'")),
        Command::Switch(None) => {
            let names = sessions.names().join(", ");
            return say(out, Color::Yellow, &format!("Usage: /switch <name> ({names})"));
        }
        Command::Help => return say(out, Color::Cyan, HELP),
        Command::Unknown(name) => {
            say(out, Color::Yellow, &format!("Unknown command: /{name}"))?;
            return say(out, Color::Cyan, HELP);
        }
    };

    match result {
        Ok(msg) => say(out, Color::Cyan, &msg),
        Err(err) => say(out, Color::Red, &err.to_string()),
    }
}

/// Send one turn and print the answer as it arrives.
///
/// The reply is kept in the local history only when the stream completes without an
/// error item.
fn chat_turn<W: Write>(
    api: &ApiRequest,
    config: &RelayConfig,
    sessions: &mut DialogueSessions,
    prompt_name: &str,
    query: String,
    out: &mut W,
) -> io::Result<()> {
    let request = ChatRequest {
        conversation_id: sessions.current().conversation_id.clone(),
        history: sessions.recent_history(config.history_len),
        model_name: config.default_model().to_string(),
        temperature: Some(config.temperature),
        prompt_name: prompt_name.to_string(),
        ..ChatRequest::new(query.clone())
    };
    debug!(session = %sessions.current().name, "sending turn");

    out.queue(SetForegroundColor(Color::Blue))?
        .queue(SetAttribute(Attribute::Bold))?;
    let mut reply = String::new();
    let mut failed = None;
    for item in api.chat(request) {
        match item {
            StreamItem::Data(chunk) => {
                reply.push_str(&chunk.text);
                out.queue(Print(&chunk.text))?;
                out.flush()?;
            }
            StreamItem::Error(err) => {
                failed = Some(err.msg);
                break;
            }
        }
    }
    out.queue(SetAttribute(Attribute::Reset))?
        .queue(SetForegroundColor(Color::Reset))?
        .queue(Print("\n"))?;
    out.flush()?;

    match failed {
        Some(msg) => say(out, Color::Red, &format!("Error: {msg}")),
        None => {
            let history = &mut sessions.current_mut().history;
            history.push(History::new("user", query));
            history.push(History::new("assistant", reply));
            Ok(())
        }
    }
}

/// Drive the dashboard loop over arbitrary input and output.
pub fn run_with<R: BufRead, W: Write>(
    api: &ApiRequest,
    config: &RelayConfig,
    sessions: &mut DialogueSessions,
    prompt_name: &str,
    input: R,
    out: &mut W,
) -> io::Result<()> {
    let mut lines = input.lines();
    loop {
        out.queue(SetForegroundColor(Color::Green))?
            .queue(Print(format!("[{}] You: ", sessions.current().name)))?
            .queue(SetForegroundColor(Color::Reset))?;
        out.flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        match parse_input(&line?) {
            Input::Empty => continue,
            Input::Exit => break,
            Input::Command(command) => apply_command(sessions, command, out)?,
            Input::Query(query) => chat_turn(api, config, sessions, prompt_name, query, out)?,
        }
    }
    Ok(())
}

/// Run the dashboard on the terminal.
pub fn run(
    config: &RelayConfig,
    session: Option<String>,
    prompt_name: &str,
) -> Result<(), Box<dyn Error>> {
    let api = ApiRequest::from_config(config)?;
    let mut sessions = DialogueSessions::new();
    if let Some(name) = session.filter(|n| n != DEFAULT_SESSION) {
        sessions.create(Some(&name))?;
    }

    println!("Backend: {}", config.api_address);
    println!("Type /help for commands.");
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    run_with(&api, config, &mut sessions, prompt_name, stdin.lock(), &mut stdout)?;
    Ok(())
}
