//! Terminal front end: reads commands from stdin and prints session updates.

use duplex_voice::{Handle, Notice, Observer, Phase};
use std::io::{self, BufRead, Write};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Listen,
    Stop,
    Cancel,
    Acknowledge,
    Quit,
    Say(String),
    Help,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let command = match line {
            "/listen" | "/l" => Command::Listen,
            "/stop" | "/s" => Command::Stop,
            "/cancel" | "/c" => Command::Cancel,
            "/ack" => Command::Acknowledge,
            "/quit" | "/q" => Command::Quit,
            "/help" | "/?" => Command::Help,
            text => Command::Say(text.to_string()),
        };
        Some(command)
    }
}

const HELP: &str = "commands: /listen, /stop, /cancel, /ack, /quit; anything else is sent as text";

/// Blocks on stdin until `/quit` or end of input, then shuts the client down.
pub fn run(handle: Handle) {
    println!("{HELP}");
    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("failed to read stdin: {}", e);
                break;
            }
        };
        let Some(command) = Command::parse(&line) else {
            continue;
        };
        let result = match command {
            Command::Listen => handle.start_listening(),
            Command::Stop => handle.stop_listening(),
            Command::Cancel => handle.interrupt(),
            Command::Acknowledge => handle.acknowledge_error(),
            Command::Say(text) => handle.submit_text(&text),
            Command::Help => {
                println!("{HELP}");
                Ok(())
            }
            Command::Quit => break,
        };
        if let Err(e) = result {
            tracing::warn!("{}", e);
            return;
        }
    }
    if let Err(e) = handle.shutdown() {
        tracing::debug!("{}", e);
    }
}

/// Prints transcripts and responses as they stream in.
#[derive(Default)]
pub struct ConsoleObserver {
    streaming: bool,
}

impl ConsoleObserver {
    fn end_line(&mut self, out: &mut impl Write) -> io::Result<()> {
        if self.streaming {
            writeln!(out)?;
            self.streaming = false;
        }
        Ok(())
    }
}

impl Observer for ConsoleObserver {
    fn on_update(&mut self, phase: Phase, notice: Option<&Notice>) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        match notice {
            None => {
                self.end_line(&mut out)?;
                writeln!(out, "[{phase}]")?;
            }
            Some(Notice::Partial(text)) => {
                write!(out, "\r... {text}")?;
                self.streaming = true;
            }
            Some(Notice::Utterance(utterance)) => {
                self.end_line(&mut out)?;
                writeln!(out, "you: {}", utterance.text)?;
            }
            Some(Notice::Text { delta, .. }) => {
                if !self.streaming {
                    write!(out, "assistant: ")?;
                    self.streaming = true;
                }
                write!(out, "{delta}")?;
            }
            Some(Notice::Completed {
                sources,
                interrupted,
                ..
            }) => {
                self.end_line(&mut out)?;
                if *interrupted {
                    writeln!(out, "(response was interrupted)")?;
                }
                for source in sources {
                    match &source.locator {
                        Some(locator) => writeln!(out, "  source: {} ({})", source.source, locator)?,
                        None => writeln!(out, "  source: {}", source.source)?,
                    }
                }
            }
            Some(Notice::Cancelled(id)) => {
                self.end_line(&mut out)?;
                writeln!(out, "(request {id} cancelled)")?;
            }
            Some(Notice::Status(message)) => {
                tracing::info!("recognition: {}", message);
            }
            Some(Notice::Failure(reason)) => {
                self.end_line(&mut out)?;
                writeln!(out, "error: {reason}; type /ack to continue")?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_commands_parse() {
        assert_eq!(Command::parse("/listen"), Some(Command::Listen));
        assert_eq!(Command::parse(" /q "), Some(Command::Quit));
        assert_eq!(Command::parse("/ack"), Some(Command::Acknowledge));
        assert_eq!(Command::parse("   "), None);
    }

    #[test]
    fn anything_else_is_spoken_text() {
        assert_eq!(
            Command::parse("what is a monad?"),
            Some(Command::Say("what is a monad?".into()))
        );
        assert_eq!(Command::parse("/unknown"), Some(Command::Say("/unknown".into())));
    }
}
