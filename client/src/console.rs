/// Commands typed into the headless client's stdin
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Play,
    Pause,
    Seek(f64),
    Load(String),
    /// End the current stream as if playback ran out
    End,
    /// Host only: push a forced sync
    ForceSync,
    /// Joiner only: join another room after a rejection
    Join(String),
    Status,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return Err("Empty command".to_string());
        };
        let arg = parts.next();

        let command = match (verb.to_ascii_lowercase().as_str(), arg) {
            ("play", None) => ConsoleCommand::Play,
            ("pause", None) => ConsoleCommand::Pause,
            ("seek", Some(value)) => ConsoleCommand::Seek(
                value
                    .parse::<f64>()
                    .ok()
                    .filter(|t| t.is_finite() && *t >= 0.0)
                    .ok_or_else(|| format!("Invalid seek target: {value}"))?,
            ),
            ("load", Some(stream_id)) => ConsoleCommand::Load(stream_id.to_string()),
            ("end", None) => ConsoleCommand::End,
            ("sync", None) => ConsoleCommand::ForceSync,
            ("join", Some(room_id)) => ConsoleCommand::Join(room_id.to_string()),
            ("status", None) => ConsoleCommand::Status,
            ("quit" | "exit", None) => ConsoleCommand::Quit,
            _ => return Err(format!("Unknown command: {}", line.trim())),
        };

        if parts.next().is_some() {
            return Err(format!("Too many arguments: {}", line.trim()));
        }
        Ok(command)
    }
}

pub const HOST_HELP: &str = "commands: play | pause | seek <secs> | load <stream> | end | sync | status | quit";
pub const JOINER_HELP: &str = "commands: join <room> | status | quit";
