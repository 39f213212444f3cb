use super::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    Executable,
    Daemon,
    Library,
}

impl CommandType {
    /// Inverse of the `as i32` cast used when writing `commands.type` (spec §6).
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => CommandType::Daemon,
            2 => CommandType::Library,
            _ => CommandType::Executable,
        }
    }
}

/// One launchable entry point an installed application exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub path: String,
    pub arguments: Vec<String>,
    pub kind: CommandType,
    /// Set while the command has a running instance; `None` otherwise.
    pub pid: Option<u32>,
}

/// One installed revision of an application, on a tracking channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub channel: String,
    pub version: Version,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Keyed by unique name. Created by install transactions, destroyed by
/// remove transactions (cascades to commands and revisions, spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub commands: Vec<Command>,
    pub revisions: Vec<Revision>,
}

impl Application {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: Vec::new(),
            revisions: Vec::new(),
        }
    }

    /// Most recently created revision, if any.
    pub fn latest_revision(&self) -> Option<&Revision> {
        self.revisions.iter().max_by_key(|r| r.created_at)
    }
}
