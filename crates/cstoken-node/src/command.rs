//! Operator commands, shared by the CLI subcommands and the stdin console of `run`.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use cstoken_core::types::NodeAddress;
use cstoken_protocol::mutex::ProtocolError;
use cstoken_protocol::registry::RegistryError;
use cstoken_protocol::tasks::TaskError;

/// A request made to a runtime by its operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register {
        address: NodeAddress,
        name: String,
        parent: Option<NodeAddress>,
    },
    Connect {
        address: NodeAddress,
        process_id: String,
    },
    Disconnect {
        address: NodeAddress,
    },
    Reparent {
        address: NodeAddress,
        parent: NodeAddress,
    },
    /// Ask for the token on behalf of `address`.
    Request {
        address: NodeAddress,
    },
    /// Hand `root`'s token back on behalf of `holder`.
    Release {
        root: NodeAddress,
        holder: NodeAddress,
    },
    SignIn {
        name: String,
    },
    SignOut,
    PostBoard {
        gen_id: String,
        board: Vec<Vec<u8>>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("Task manager lease refused: {0}")]
    LeaseHeld(String),
}

/// Command-line form of [`Command`].
#[derive(Debug, Clone, Subcommand)]
pub enum Action {
    /// Register a node; without --parent it becomes a root
    Register {
        address: String,
        name: String,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Mark a node connected under a process id
    Connect { address: String, process_id: String },
    /// Mark a node disconnected
    Disconnect { address: String },
    /// Move a node's dynamic parent pointer
    Reparent { address: String, parent: String },
    /// Request the token for a node
    Request { address: String },
    /// Release a root's token held by a node
    Release { root: String, holder: String },
    /// Sign in as the task manager
    SignIn { name: String },
    /// Give up the task manager role
    SignOut,
    /// Split a board (JSON array of 0/1 rows) into tasks for a generation
    PostBoard { gen_id: String, path: PathBuf },
}

impl Action {
    /// Resolve into a [`Command`]. Reads the board file of `post-board`.
    pub fn into_command(self) -> anyhow::Result<Command> {
        Ok(match self {
            Action::Register { address, name, parent } => Command::Register {
                address: address.into(),
                name,
                parent: parent.map(NodeAddress::from),
            },
            Action::Connect { address, process_id } => Command::Connect {
                address: address.into(),
                process_id,
            },
            Action::Disconnect { address } => Command::Disconnect {
                address: address.into(),
            },
            Action::Reparent { address, parent } => Command::Reparent {
                address: address.into(),
                parent: parent.into(),
            },
            Action::Request { address } => Command::Request {
                address: address.into(),
            },
            Action::Release { root, holder } => Command::Release {
                root: root.into(),
                holder: holder.into(),
            },
            Action::SignIn { name } => Command::SignIn { name },
            Action::SignOut => Command::SignOut,
            Action::PostBoard { gen_id, path } => {
                let data = std::fs::read(&path)
                    .with_context(|| format!("Failed to read board from {}", path.display()))?;
                let board: Vec<Vec<u8>> = serde_json::from_slice(&data)
                    .with_context(|| format!("Failed to parse board in {}", path.display()))?;
                Command::PostBoard { gen_id, board }
            }
        })
    }
}

#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true)]
struct ConsoleLine {
    #[command(subcommand)]
    action: Action,
}

/// Parse one console line, e.g. `request 5080` or `release 5010 5080`.
pub fn parse_line(line: &str) -> anyhow::Result<Command> {
    let line = ConsoleLine::try_parse_from(line.split_whitespace())
        .map_err(|e| anyhow::anyhow!("{}", e.render()))?;
    line.action.into_command()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_protocol_commands() {
        assert_eq!(
            parse_line("request 5080").unwrap(),
            Command::Request { address: "5080".into() }
        );
        assert_eq!(
            parse_line("release 5010 5080").unwrap(),
            Command::Release {
                root: "5010".into(),
                holder: "5080".into()
            }
        );
        assert_eq!(
            parse_line("connect 5010 p1").unwrap(),
            Command::Connect {
                address: "5010".into(),
                process_id: "p1".into()
            }
        );
        assert_eq!(
            parse_line("register 5080 Apple --parent 5010").unwrap(),
            Command::Register {
                address: "5080".into(),
                name: "Apple".into(),
                parent: Some("5010".into())
            }
        );
        assert_eq!(parse_line("sign-out").unwrap(), Command::SignOut);
    }

    #[test]
    fn rejects_unknown_or_incomplete_lines() {
        assert!(parse_line("fly 5010").is_err());
        assert!(parse_line("release 5010").is_err());
        assert!(parse_line("").is_err());
    }

    #[test]
    fn post_board_reads_the_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("board.json");
        std::fs::write(&path, b"[[0,1,0],[0,1,0]]").unwrap();
        let cmd = parse_line(&format!("post-board g1 {}", path.display())).unwrap();
        assert_eq!(
            cmd,
            Command::PostBoard {
                gen_id: "g1".into(),
                board: vec![vec![0, 1, 0], vec![0, 1, 0]]
            }
        );
    }
}
