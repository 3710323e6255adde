use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::warn;
use serde::Serialize;

use crate::dram::DramCommand;
use crate::interconnect::{AxiTransaction, TxnKind, TxnOrigin};
use crate::sim::error::{SimError, SimResult};
use crate::sim::request::{MemOp, RequestId, RequestStatus, Response};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnEvent {
    Submitted,
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxnRecord {
    pub cycle: Cycle,
    pub event: TxnEvent,
    pub id: u64,
    pub addr: u64,
    pub bytes: u32,
    pub kind: TxnKind,
    pub qos: u8,
    pub origin: TxnOrigin,
    pub granted_at: Option<Cycle>,
}

impl TxnRecord {
    pub fn new(cycle: Cycle, event: TxnEvent, txn: &AxiTransaction) -> Self {
        Self {
            cycle,
            event,
            id: txn.id,
            addr: txn.addr,
            bytes: txn.bytes,
            kind: txn.kind,
            qos: txn.qos,
            origin: txn.origin,
            granted_at: txn.granted_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRecord {
    pub cycle: Cycle,
    pub id: RequestId,
    pub agent: usize,
    pub addr: u64,
    pub size: u32,
    pub op: MemOp,
    pub status: RequestStatus,
    pub latency: Cycle,
}

impl From<&Response> for RequestRecord {
    fn from(r: &Response) -> Self {
        Self {
            cycle: r.completed_at,
            id: r.id,
            agent: r.agent,
            addr: r.addr,
            size: r.size,
            op: r.op,
            status: r.status,
            latency: r.latency,
        }
    }
}

/// One line of the command log, in the order things happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    Dram(DramCommand),
    Transaction(TxnRecord),
    Request(RequestRecord),
}

impl LogRecord {
    pub fn cycle(&self) -> Cycle {
        match self {
            LogRecord::Dram(cmd) => cmd.issued_at,
            LogRecord::Transaction(t) => t.cycle,
            LogRecord::Request(r) => r.cycle,
        }
    }
}

struct JsonLines {
    path: PathBuf,
    writer: BufWriter<File>,
}

/// Time-ordered record of transactions, DRAM commands and finished requests. Records are kept
/// in memory when `keep` is set and streamed as JSON lines when a path is given.
pub struct CommandLog {
    keep: bool,
    records: Vec<LogRecord>,
    sink: Option<JsonLines>,
}

impl std::fmt::Debug for CommandLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandLog")
            .field("keep", &self.keep)
            .field("records", &self.records.len())
            .field("path", &self.sink.as_ref().map(|s| &s.path))
            .finish()
    }
}

impl CommandLog {
    pub fn new(keep: bool, path: Option<&Path>) -> SimResult<Self> {
        let sink = match path {
            Some(path) => {
                let file = File::create(path).map_err(|err| {
                    SimError::config(format!("cannot create command log {}: {err}", path.display()))
                })?;
                Some(JsonLines {
                    path: path.to_path_buf(),
                    writer: BufWriter::new(file),
                })
            }
            None => None,
        };
        Ok(Self {
            keep,
            records: Vec::new(),
            sink,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.keep || self.sink.is_some()
    }

    pub fn push(&mut self, record: LogRecord) {
        if let Some(sink) = &mut self.sink {
            let written = serde_json::to_string(&record)
                .map_err(|err| err.to_string())
                .and_then(|line| writeln!(sink.writer, "{line}").map_err(|err| err.to_string()));
            if let Err(err) = written {
                warn!("command log {}: {err}; streaming stopped", sink.path.display());
                self.sink = None;
            }
        }
        if self.keep {
            self.records.push(record);
        }
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn dram_commands(&self) -> impl Iterator<Item = &DramCommand> + '_ {
        self.records.iter().filter_map(|r| match r {
            LogRecord::Dram(cmd) => Some(cmd),
            _ => None,
        })
    }

    pub fn flush(&mut self) {
        if let Some(sink) = &mut self.sink {
            if let Err(err) = sink.writer.flush() {
                warn!("command log {}: {err}", sink.path.display());
            }
        }
    }
}

impl Drop for CommandLog {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dram::CommandKind;

    fn act(at: Cycle) -> LogRecord {
        LogRecord::Dram(DramCommand {
            kind: CommandKind::Act,
            channel: 0,
            rank: 0,
            bank: 3,
            row: 9,
            earliest: at,
            issued_at: at,
            completes_at: at + 16,
        })
    }

    #[test]
    fn records_serialize_with_a_type_tag() {
        let line = serde_json::to_string(&act(5)).unwrap();
        assert!(line.starts_with("{\"type\":\"dram\""), "{line}");
        assert!(line.contains("\"kind\":\"ACT\""));
    }

    #[test]
    fn streams_json_lines_to_a_file() {
        let path = std::env::temp_dir().join(format!("socmem-log-{}.jsonl", std::process::id()));
        {
            let mut log = CommandLog::new(false, Some(&path)).unwrap();
            log.push(act(1));
            log.push(act(2));
            assert!(log.records().is_empty());
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(2, text.lines().count());
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(1, first["issued_at"]);
    }

    #[test]
    fn kept_records_filter_dram_commands() {
        let mut log = CommandLog::new(true, None).unwrap();
        log.push(act(1));
        log.push(LogRecord::Request(RequestRecord {
            cycle: 4,
            id: 0,
            agent: 0,
            addr: 0,
            size: 4,
            op: MemOp::Read,
            status: RequestStatus::Ok,
            latency: 4,
        }));
        assert_eq!(2, log.records().len());
        assert_eq!(1, log.dram_commands().count());
        assert_eq!(4, log.records()[1].cycle());
    }
}
