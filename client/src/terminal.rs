//! Line-oriented terminal front end.

use crate::error::ClientError;
use crate::events::EventSink;
use crate::network::ClientHandle;
use log::debug;
use shared::{User, UserMessage};
use std::io::{self, BufRead, Write};
use std::thread;

/// Prints chat events to stdout.
#[derive(Debug, Default)]
pub struct TerminalSink;

impl TerminalSink {
    fn print(&self, line: String) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    }
}

impl EventSink for TerminalSink {
    fn user_connected(&mut self, user: &User) {
        self.print(format!("* {} joined", user.name));
    }

    fn user_disconnected(&mut self, user: &User) {
        self.print(format!("* {} left", user.name));
    }

    fn user_start_typing(&mut self, user: &User) {
        self.print(format!("* {} is typing...", user.name));
    }

    fn message_received(&mut self, message: &UserMessage) {
        self.print(format!("<{}> {}", message.sender_name, message.text));
    }

    fn ping_updated(&mut self, user: &User) {
        debug!("{}", user);
    }

    fn timeout_warning(&mut self, seconds: u64) {
        self.print(format!("! no reply from server for {}s", seconds));
    }

    fn connection_restored(&mut self) {
        self.print("! connection restored".to_string());
    }

    fn fatal_error(&mut self, error: &ClientError) {
        self.print(format!("! {}", error));
    }
}

/// What a line typed at the prompt asks for
#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Message(&'a str),
    Typing,
    Quit,
    Empty,
}

pub fn parse_line(line: &str) -> Input<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.trim() {
        "" => Input::Empty,
        "/quit" | "/exit" => Input::Quit,
        "/typing" => Input::Typing,
        _ => Input::Message(line),
    }
}

/// Reads stdin on a dedicated thread and turns lines into client commands.
///
/// End of input counts as `/quit`.
pub fn spawn_stdin_reader(handle: ClientHandle) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match parse_line(&line) {
                Input::Message(text) => {
                    if !handle.send_message(text) {
                        eprintln!("! message is too long");
                    }
                }
                Input::Typing => handle.typing(),
                Input::Quit => break,
                Input::Empty => {}
            }
        }
        handle.exit();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("hello there\n"), Input::Message("hello there"));
        assert_eq!(parse_line("  /quit \r\n"), Input::Quit);
        assert_eq!(parse_line("/exit"), Input::Quit);
        assert_eq!(parse_line("/typing"), Input::Typing);
        assert_eq!(parse_line("   "), Input::Empty);
    }
}
