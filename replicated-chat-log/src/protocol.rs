//! Console command parsing for the node shell.
//!
//! `SAY` goes through the replicated store; `HISTORY` and `GET` read the local
//! store; `JOIN` and `PING` talk to the cluster state machine directly.

use anyhow::{Result, anyhow, bail};

/// `HISTORY` page size when none is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

const USAGE: &str = "invalid command. Try: SAY/m <group> <text>, HISTORY/l <group> [limit] [offset], \
GET/g <id>, JOIN/j <addr>..., PING/p, STATUS/s, HELP/h, EXIT/e";

/// Commands that can be entered at the prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Say { group: String, text: String },
    History { group: String, limit: usize, offset: usize },
    Get { id: u64 },
    Join { peers: Vec<String> },
    Ping,
    Status,
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses a line of user input.
    ///
    /// Commands are case-insensitive and have single-letter aliases:
    /// - `SAY <group> <text...>` (alias: `m`) - replicate a chat message
    /// - `HISTORY <group> [limit] [offset]` (alias: `l`) - newest-first page
    /// - `GET <id>` (alias: `g`) - look a message up by id
    /// - `JOIN <addr>...` (alias: `j`) - add peers to the cluster
    /// - `PING` (alias: `p`) - commit a probe through consensus
    /// - `STATUS` (alias: `s`) - show role, leader and members
    /// - `HELP` (alias: `h`) - print command reference
    /// - `EXIT` (alias: `e`) - shut down this node
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let mut words = trimmed.splitn(2, char::is_whitespace);
        let Some(first) = words.next().filter(|w| !w.is_empty()) else {
            bail!("empty command");
        };
        let rest = words.next().unwrap_or("").trim();
        let args: Vec<&str> = rest.split_whitespace().collect();

        let cmd = first.to_uppercase();
        let normalized = match cmd.as_str() {
            "M" => "SAY",
            "L" => "HISTORY",
            "G" => "GET",
            "J" => "JOIN",
            "P" => "PING",
            "S" => "STATUS",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (normalized, args.len()) {
            ("EXIT", 0) => Ok(ConsoleCommand::Exit),
            ("HELP", 0) => Ok(ConsoleCommand::Help),
            ("STATUS", 0) => Ok(ConsoleCommand::Status),
            ("PING", 0) => Ok(ConsoleCommand::Ping),
            ("SAY", n) if n >= 2 => {
                let (group, text) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("SAY requires a group and text"))?;
                Ok(ConsoleCommand::Say {
                    group: group.to_string(),
                    text: text.trim().to_string(),
                })
            }
            ("SAY", _) => Err(anyhow!("SAY requires a group and text: SAY <group> <text>")),
            ("HISTORY", 1..=3) => Ok(ConsoleCommand::History {
                group: args[0].to_string(),
                limit: parse_count(args.get(1), "limit", DEFAULT_HISTORY_LIMIT)?,
                offset: parse_count(args.get(2), "offset", 0)?,
            }),
            ("HISTORY", _) => Err(anyhow!("usage: HISTORY <group> [limit] [offset]")),
            ("GET", 1) => {
                let id = args[0]
                    .parse()
                    .map_err(|_| anyhow!("message id must be a number, got {:?}", args[0]))?;
                Ok(ConsoleCommand::Get { id })
            }
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <id>")),
            ("JOIN", n) if n > 0 => Ok(ConsoleCommand::Join {
                peers: args.iter().map(|a| a.to_string()).collect(),
            }),
            ("JOIN", _) => Err(anyhow!("JOIN requires at least one address")),
            _ => Err(anyhow!(USAGE)),
        }
    }

    pub fn help() -> &'static str {
        "SAY/m <group> <text>              replicate a chat message\n\
         HISTORY/l <group> [limit] [offset] newest-first history\n\
         GET/g <id>                        message by id\n\
         JOIN/j <addr>...                  add peers (leader only)\n\
         PING/p                            commit a probe entry\n\
         STATUS/s                          role, leader and members\n\
         HELP/h                            this text\n\
         EXIT/e                            shut down"
    }
}

fn parse_count(arg: Option<&&str>, name: &str, default: usize) -> Result<usize> {
    match arg {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("{name} must be a non-negative number, got {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_commands() {
        assert!(matches!(ConsoleCommand::parse("exit"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("ExIt"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("help"), Ok(ConsoleCommand::Help)));
        assert!(matches!(ConsoleCommand::parse("STATUS"), Ok(ConsoleCommand::Status)));
        assert!(matches!(ConsoleCommand::parse("Ping"), Ok(ConsoleCommand::Ping)));
    }

    #[test]
    fn test_aliases() {
        assert!(matches!(ConsoleCommand::parse("e"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("H"), Ok(ConsoleCommand::Help)));
        assert!(matches!(ConsoleCommand::parse("s"), Ok(ConsoleCommand::Status)));
        assert!(matches!(ConsoleCommand::parse("p"), Ok(ConsoleCommand::Ping)));
        assert_eq!(
            ConsoleCommand::parse("g 42").unwrap(),
            ConsoleCommand::Get { id: 42 }
        );
        assert_eq!(
            ConsoleCommand::parse("j 127.0.0.1:5001").unwrap(),
            ConsoleCommand::Join {
                peers: vec!["127.0.0.1:5001".into()]
            }
        );
        assert_eq!(
            ConsoleCommand::parse("l lobby").unwrap(),
            ConsoleCommand::History {
                group: "lobby".into(),
                limit: DEFAULT_HISTORY_LIMIT,
                offset: 0
            }
        );
    }

    #[test]
    fn say_keeps_the_whole_text() {
        assert_eq!(
            ConsoleCommand::parse("SAY lobby hello   there, world").unwrap(),
            ConsoleCommand::Say {
                group: "lobby".into(),
                text: "hello   there, world".into()
            }
        );
        assert_eq!(
            ConsoleCommand::parse("m room1 hi").unwrap(),
            ConsoleCommand::Say {
                group: "room1".into(),
                text: "hi".into()
            }
        );
    }

    #[test]
    fn history_takes_optional_limit_and_offset() {
        assert_eq!(
            ConsoleCommand::parse("history lobby 5 10").unwrap(),
            ConsoleCommand::History {
                group: "lobby".into(),
                limit: 5,
                offset: 10
            }
        );
        assert!(ConsoleCommand::parse("history lobby five").is_err());
        assert!(ConsoleCommand::parse("history lobby 1 2 3").is_err());
    }

    #[test]
    fn join_accepts_several_peers() {
        assert_eq!(
            ConsoleCommand::parse("JOIN a:1 b:2").unwrap(),
            ConsoleCommand::Join {
                peers: vec!["a:1".into(), "b:2".into()]
            }
        );
    }

    #[test]
    fn test_invalid_commands() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("   ").is_err());
        assert!(ConsoleCommand::parse("INVALID").is_err());
        assert!(ConsoleCommand::parse("GET").is_err());
        assert!(ConsoleCommand::parse("GET abc").is_err());
        assert!(ConsoleCommand::parse("SAY lobby").is_err());
        assert!(ConsoleCommand::parse("JOIN").is_err());
        assert!(ConsoleCommand::parse("STATUS now").is_err());
    }
}
