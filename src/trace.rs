// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Offline loading of per-rank trace files.
//!
//! A trace cut short by a forced dump is a valid partial file: an
//! unparseable final line is tolerated (the process died mid-write), and
//! a missing seal record only marks the trace unsealed. Anything else
//! malformed excludes that rank from analysis, never the whole run.

use crate::config;
use crate::event::{CallEvent, TraceRecord};
use crate::topology::Topology;

use log::warn;

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub rank: i32,
    pub world_size: i32,
    pub host: String,
    pub topology: Option<Topology>,
    pub events: Vec<CallEvent>,
    pub sealed: bool,
}

#[derive(Debug)]
pub enum TraceLoadError {
    /// no trace file for a rank the other headers say should exist
    Missing { rank: i32 },
    Io { path: PathBuf, error: std::io::Error },
    Corrupt { path: PathBuf, line_no: usize, reason: String },
}

impl std::fmt::Display for TraceLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceLoadError::Missing { rank } => {
                write!(f, "no trace file for rank {}", rank)
            }
            TraceLoadError::Io { path, error } => {
                write!(f, "cannot read {}: {}", path.display(), error)
            }
            TraceLoadError::Corrupt { path, line_no, reason } => {
                write!(f, "corrupt trace {} (line {}): {}", path.display(), line_no, reason)
            }
        }
    }
}

fn corrupt(path: &Path, line_no: usize, reason: impl Into<String>) -> TraceLoadError {
    TraceLoadError::Corrupt {
        path: path.to_path_buf(),
        line_no,
        reason: reason.into(),
    }
}

pub fn load_file(path: &Path) -> Result<Trace, TraceLoadError> {
    let data = std::fs::read_to_string(path).map_err(|error| TraceLoadError::Io {
        path: path.to_path_buf(),
        error,
    })?;

    let lines: Vec<&str> = data.lines().collect();
    let mut trace: Option<Trace> = None;

    for (i, line) in lines.iter().enumerate() {
        let line_no = i + 1;
        let Some(record) = TraceRecord::parse(line) else {
            if i + 1 == lines.len() {
                // torn final line from a forced dump; everything before
                // it is still usable
                warn!("{}: ignoring truncated final line", path.display());
                break;
            }
            return Err(corrupt(path, line_no, "unparseable record"));
        };

        match record {
            TraceRecord::Header(h) => {
                if trace.is_some() {
                    return Err(corrupt(path, line_no, "duplicate header"));
                }
                trace = Some(Trace {
                    rank: h.rank,
                    world_size: h.world_size,
                    host: h.host,
                    topology: None,
                    events: Vec::new(),
                    sealed: false,
                });
            }
            TraceRecord::Topology(hosts) => {
                let trace = trace
                    .as_mut()
                    .ok_or_else(|| corrupt(path, line_no, "topology before header"))?;
                trace.topology = Some(Topology { hosts });
            }
            TraceRecord::Event(ev) => {
                let trace = trace
                    .as_mut()
                    .ok_or_else(|| corrupt(path, line_no, "event before header"))?;
                if trace.sealed {
                    return Err(corrupt(path, line_no, "event after seal"));
                }
                let expected = trace.events.len() as u64;
                if ev.seq != expected {
                    return Err(corrupt(
                        path,
                        line_no,
                        format!("sequence gap: expected {}, found {}", expected, ev.seq),
                    ));
                }
                trace.events.push(ev);
            }
            TraceRecord::Seal { n_events } => {
                let trace = trace
                    .as_mut()
                    .ok_or_else(|| corrupt(path, line_no, "seal before header"))?;
                if n_events != trace.events.len() as u64 {
                    return Err(corrupt(
                        path,
                        line_no,
                        format!("seal claims {} events, found {}", n_events, trace.events.len()),
                    ));
                }
                trace.sealed = true;
            }
        }
    }

    trace.ok_or_else(|| corrupt(path, 1, "missing header"))
}

/// Loads every trace in a directory. Per-rank failures are collected,
/// not fatal; ranks the surviving headers imply but that have no file at
/// all are reported as missing.
pub fn load_dir(dir: &Path) -> std::io::Result<(Vec<Trace>, Vec<TraceLoadError>)> {
    let mut traces = Vec::new();
    let mut errors = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(file_rank) = name.to_str().and_then(config::rank_from_file_name) else {
            continue;
        };
        let path = entry.path();
        match load_file(&path) {
            Ok(trace) => {
                if trace.rank != file_rank {
                    errors.push(corrupt(
                        &path,
                        1,
                        format!("header rank {} does not match file name", trace.rank),
                    ));
                } else {
                    traces.push(trace);
                }
            }
            Err(e) => errors.push(e),
        }
    }

    traces.sort_by_key(|t| t.rank);

    let world_size = traces.iter().map(|t| t.world_size).max().unwrap_or(0);
    let errored: Vec<PathBuf> = errors
        .iter()
        .filter_map(|e| match e {
            TraceLoadError::Io { path, .. } | TraceLoadError::Corrupt { path, .. } => {
                Some(path.clone())
            }
            TraceLoadError::Missing { .. } => None,
        })
        .collect();
    for rank in 0..world_size {
        let have = traces.iter().any(|t| t.rank == rank);
        let failed = errored.iter().any(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(config::rank_from_file_name)
                == Some(rank)
        });
        if !have && !failed {
            errors.push(TraceLoadError::Missing { rank });
        }
    }

    Ok((traces, errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ArgSignature, CallEvent, TraceHeader};
    use crate::registry::{DatatypeId, Opcode};

    fn header_line(rank: i32, world_size: i32) -> String {
        TraceRecord::Header(TraceHeader {
            rank,
            world_size,
            host: format!("node-{}", rank),
        })
        .to_json()
        .to_string()
    }

    fn event_line(seq: u64) -> String {
        TraceRecord::Event(CallEvent {
            seq,
            op: Opcode::Bcast,
            comm: 0,
            sig: ArgSignature {
                count: Some(1),
                datatype: Some(DatatypeId::Int),
                peer_or_root: Some(0),
                tag: None,
            },
            ts_ns: seq * 10,
            checked: true,
        })
        .to_json()
        .to_string()
    }

    fn write_trace(name: &str, lines: &[String]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "collcheck-load-{}-{}.trace",
            std::process::id(),
            name
        ));
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    #[test]
    fn load_complete_trace() {
        let path = write_trace(
            "complete",
            &[
                header_line(0, 2),
                TraceRecord::Topology(vec![String::from("a"), String::from("b")])
                    .to_json()
                    .to_string(),
                event_line(0),
                event_line(1),
                TraceRecord::Seal { n_events: 2 }.to_json().to_string(),
            ],
        );
        let trace = load_file(&path).unwrap();
        assert_eq!(trace.rank, 0);
        assert_eq!(trace.world_size, 2);
        assert_eq!(trace.events.len(), 2);
        assert!(trace.sealed);
        assert_eq!(trace.topology.as_ref().unwrap().world_size(), 2);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn truncated_final_line_tolerated() {
        let path = write_trace("truncated", &[header_line(0, 1), event_line(0)]);
        {
            use std::io::Write as _;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            write!(f, "{{\"seq\": 1, \"op\"").unwrap();
        }
        let trace = load_file(&path).unwrap();
        assert_eq!(trace.events.len(), 1);
        assert!(!trace.sealed);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn garbage_mid_file_is_corrupt() {
        let path = write_trace(
            "midgarbage",
            &[header_line(0, 1), String::from("not json"), event_line(0)],
        );
        assert!(matches!(
            load_file(&path),
            Err(TraceLoadError::Corrupt { line_no: 2, .. })
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn sequence_gap_is_corrupt() {
        let path = write_trace("gap", &[header_line(0, 1), event_line(0), event_line(2)]);
        assert!(matches!(
            load_file(&path),
            Err(TraceLoadError::Corrupt { line_no: 3, .. })
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn load_dir_reports_missing_rank() {
        let dir = std::env::temp_dir().join(format!(
            "collcheck-dir-{}-missing",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        for rank in [0, 2] {
            std::fs::write(
                dir.join(config::trace_file_name(rank)),
                header_line(rank, 3) + "\n",
            )
            .unwrap();
        }
        let (traces, errors) = load_dir(&dir).unwrap();
        assert_eq!(traces.len(), 2);
        assert!(errors
            .iter()
            .any(|e| matches!(e, TraceLoadError::Missing { rank: 1 })));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_dir_keeps_good_ranks_next_to_corrupt_one() {
        let dir = std::env::temp_dir().join(format!(
            "collcheck-dir-{}-corrupt",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(config::trace_file_name(0)), header_line(0, 2) + "\n").unwrap();
        std::fs::write(dir.join(config::trace_file_name(1)), "garbage\ngarbage\n").unwrap();
        let (traces, errors) = load_dir(&dir).unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].rank, 0);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], TraceLoadError::Corrupt { .. }));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
