use std::fmt;

use serde::Serialize;

use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommandKind {
    #[serde(rename = "ACT")]
    Act,
    #[serde(rename = "RD")]
    Rd,
    #[serde(rename = "WR")]
    Wr,
    #[serde(rename = "PRE")]
    Pre,
    #[serde(rename = "REF")]
    Ref,
}

impl CommandKind {
    pub const ALL: [CommandKind; 5] = [
        CommandKind::Act,
        CommandKind::Rd,
        CommandKind::Wr,
        CommandKind::Pre,
        CommandKind::Ref,
    ];

    pub fn is_column(self) -> bool {
        matches!(self, CommandKind::Rd | CommandKind::Wr)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Act => "ACT",
            CommandKind::Rd => "RD",
            CommandKind::Wr => "WR",
            CommandKind::Pre => "PRE",
            CommandKind::Ref => "REF",
        }
    }
}

/// One command put on a channel's command bus. REF targets a whole rank; its `bank` is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DramCommand {
    pub kind: CommandKind,
    pub channel: usize,
    pub rank: usize,
    pub bank: usize,
    pub row: u64,
    // earliest cycle the scheduler's constraints allowed
    pub earliest: Cycle,
    pub issued_at: Cycle,
    // data transfer end for column commands, recovery end otherwise
    pub completes_at: Cycle,
}

impl fmt::Display for DramCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ch{} r{} b{} row {}",
            self.kind.name(),
            self.issued_at,
            self.channel,
            self.rank,
            self.bank,
            self.row
        )
    }
}
