//! CLI entry point for running a replicated chat log node with a line console.
//!
//! The node opens its raft state machine, a local chat database and the
//! replicated store on top of both, then reads commands from stdin.
//!
//! # Example usage
//!
//! Start a 2-node cluster:
//! ```bash
//! # Terminal 1 (founds the cluster)
//! cargo run --bin node -- --config node1.json
//!
//! # Terminal 2 (node2.json lists node 1 in cluster_peers)
//! cargo run --bin node -- --config node2.json
//!
//! # Back in terminal 1
//! > JOIN 127.0.0.1:5001
//! ```

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use tracing::{info, warn};

use replicated_chat_log::cluster::{ClusterStateMachine, RaftStateMachine};
use replicated_chat_log::config::AppConfig;
use replicated_chat_log::message::{ChatMessage, EventMessage};
use replicated_chat_log::protocol::ConsoleCommand;
use replicated_chat_log::store::local::DEFAULT_TABLE;
use replicated_chat_log::store::{ChatLogStore, LocalLogStore, ReplicatedLogStore};
use replicated_chat_log::telemetry::init_tracing;

/// Command-line arguments for the node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a replicated chat log node")]
struct Args {
    /// JSON config file; defaults apply when omitted
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
}

/// Hands out message ids from the wall clock in microseconds, bumped so they
/// never repeat within this process.
struct IdClock {
    last: u64,
}

impl IdClock {
    fn new() -> Self {
        Self { last: 0 }
    }

    fn next(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        self.last = now.max(self.last + 1);
        self.last
    }
}

struct Console {
    config: AppConfig,
    state_machine: Arc<RaftStateMachine>,
    store: ReplicatedLogStore<LocalLogStore, RaftStateMachine>,
    ids: IdClock,
}

impl Console {
    /// Runs one command. Returns false when the console should exit.
    fn execute(&mut self, command: ConsoleCommand, out: &mut impl Write) -> Result<bool> {
        match command {
            ConsoleCommand::Say { group, text } => {
                let id = self.ids.next();
                let mut message: EventMessage =
                    ChatMessage::new("console", group.as_str(), text).into();
                message.stamp();
                match self.store.save(&group, id, message) {
                    Ok(()) => writeln!(out, "saved {id} in {group}")?,
                    Err(err) => writeln!(out, "save failed: {err}")?,
                }
            }
            ConsoleCommand::History {
                group,
                limit,
                offset,
            } => match self.store.get_messages_for(&group, "", offset, limit) {
                Ok(messages) if messages.is_empty() => writeln!(out, "no messages in {group}")?,
                Ok(messages) => {
                    for message in messages {
                        print_message(out, &message)?;
                    }
                }
                Err(err) => writeln!(out, "history failed: {err}")?,
            },
            ConsoleCommand::Get { id } => match self.store.get_message(id) {
                Ok(message) => print_message(out, &message)?,
                Err(err) => writeln!(out, "{err}")?,
            },
            ConsoleCommand::Join { peers } => {
                let failures = self.state_machine.add_peers(&peers);
                for peer in &peers {
                    match failures.get(peer) {
                        Some(err) => writeln!(out, "{peer}: {err}")?,
                        None => writeln!(out, "{peer}: added")?,
                    }
                }
            }
            ConsoleCommand::Ping => match self.state_machine.ping() {
                Ok(()) => writeln!(out, "pong")?,
                Err(err) => writeln!(out, "ping failed: {err}")?,
            },
            ConsoleCommand::Status => {
                let status = self.state_machine.status();
                writeln!(
                    out,
                    "node {} at {} | {:?} | term {} | leader {} | commit {} | applied {}",
                    status.node_id,
                    status.address,
                    status.role,
                    status.term,
                    status.leader_address.as_deref().unwrap_or("unknown"),
                    status.commit_index,
                    status.applied_index,
                )?;
                writeln!(out, "client address {}", self.config.client_bind_address())?;
                for (id, address) in &status.peers {
                    writeln!(out, "  member {id} {address}")?;
                }
            }
            ConsoleCommand::Help => writeln!(out, "{}", ConsoleCommand::help())?,
            ConsoleCommand::Exit => return Ok(false),
        }
        Ok(true)
    }
}

fn print_message(out: &mut impl Write, message: &EventMessage) -> io::Result<()> {
    match message {
        EventMessage::Chat(chat) => writeln!(
            out,
            "[{}] {} {} -> {}: {}",
            chat.recipient.base.id,
            chat.recipient.base.utc_timestamp,
            chat.recipient.from,
            chat.recipient.to,
            chat.message
        ),
        other => writeln!(out, "[{}] {} {:?}", other.id(), other.event_name(), other),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;
    config.prepare_dirs()?;
    let _telemetry = init_tracing(config.log_file.as_deref())?;

    let state_machine = Arc::new(
        RaftStateMachine::open(
            config.state_path(),
            &config.cluster_bind_address,
            config.bootstrap(),
        )
        .context("failed to open the cluster state machine")?,
    );
    let local = Arc::new(
        LocalLogStore::open(config.chat_db_path(), DEFAULT_TABLE)
            .context("failed to open the chat database")?,
    );
    let store = ReplicatedLogStore::new(local, state_machine.clone());
    state_machine
        .start()
        .context("failed to start the raft worker")?;

    if let Some(hint) = config.join_hint(&state_machine.address()) {
        info!(peers = ?config.cluster_peers, "waiting for a leader to add this node: {hint}");
    }

    let mut console = Console {
        config,
        state_machine: state_machine.clone(),
        store,
        ids: IdClock::new(),
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()?;
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        if !line.trim().is_empty() {
            let keep_going = match ConsoleCommand::parse(&line) {
                Ok(command) => console.execute(command, &mut stdout)?,
                Err(err) => {
                    warn!(error = %err, "bad command");
                    writeln!(stdout, "{err}")?;
                    true
                }
            };
            if !keep_going {
                break;
            }
        }
        write!(stdout, "> ")?;
        stdout.flush()?;
    }

    drop(console);
    state_machine.shutdown();
    Ok(())
}
