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

//! Trace events and the on-disk record format.
//!
//! A trace file is JSON lines: one header record, one topology record,
//! then call events in sequence order, then an optional seal record. A
//! file truncated after any complete line is still a valid partial trace.

use crate::registry::{DatatypeId, Opcode};

use serde_json::json;

/// Operand values that matter for consistency checking. Fields the
/// registry marks insignificant for an operation are left None.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgSignature {
    pub count: Option<i64>,
    pub datatype: Option<DatatypeId>,
    pub peer_or_root: Option<i32>,
    pub tag: Option<i32>,
}

impl ArgSignature {
    /// Equality on the fields the analyzer compares across ranks. Tags are
    /// recorded for reporting but not matched on; derived datatypes have
    /// no cross-process identity and are skipped.
    pub fn shape_matches(&self, other: &ArgSignature) -> bool {
        if self.count != other.count {
            return false;
        }
        match (self.datatype, other.datatype) {
            (Some(DatatypeId::Derived), Some(DatatypeId::Derived)) => true,
            (a, b) => a == b,
        }
    }
}

impl std::fmt::Display for ArgSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut sep = "";
        if let Some(count) = self.count {
            write!(f, "count={}", count)?;
            sep = ", ";
        }
        if let Some(dt) = self.datatype {
            write!(f, "{}datatype={}", sep, dt.name())?;
            sep = ", ";
        }
        if let Some(p) = self.peer_or_root {
            write!(f, "{}peer_or_root={}", sep, p)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEvent {
    pub seq: u64,
    pub op: Opcode,
    /// interned communicator id, first-use order, 0 = world
    pub comm: u32,
    pub sig: ArgSignature,
    pub ts_ns: u64,
    /// false when the operation was forwarded without consistency
    /// metadata (unregistered op, wildcard source)
    pub checked: bool,
}

impl CallEvent {
    pub fn trace_record(&self) -> serde_json::Value {
        let mut json = json!({
            "seq": self.seq,
            "op": self.op.name(),
            "comm": self.comm,
            "ts_ns": self.ts_ns,
        });
        if let Some(count) = self.sig.count {
            json["count"] = json!(count);
        }
        if let Some(dt) = self.sig.datatype {
            json["datatype"] = json!(dt.name());
        }
        if let Some(p) = self.sig.peer_or_root {
            json["peer_or_root"] = json!(p);
        }
        if let Some(tag) = self.sig.tag {
            json["tag"] = json!(tag);
        }
        if !self.checked {
            json["unchecked"] = json!(true);
        }
        json
    }

    pub fn from_record(v: &serde_json::Value) -> Option<Self> {
        Some(Self {
            seq: v.get("seq")?.as_u64()?,
            op: Opcode::from_name(v.get("op")?.as_str()?),
            comm: v.get("comm")?.as_u64()? as u32,
            ts_ns: v.get("ts_ns")?.as_u64()?,
            sig: ArgSignature {
                count: v.get("count").and_then(|c| c.as_i64()),
                datatype: v
                    .get("datatype")
                    .and_then(|d| d.as_str())
                    .map(DatatypeId::from_name),
                peer_or_root: v.get("peer_or_root").and_then(|p| p.as_i64()).map(|p| p as i32),
                tag: v.get("tag").and_then(|t| t.as_i64()).map(|t| t as i32),
            },
            checked: !v.get("unchecked").and_then(|u| u.as_bool()).unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHeader {
    pub rank: i32,
    pub world_size: i32,
    pub host: String,
}

impl TraceHeader {
    pub fn trace_record(&self) -> serde_json::Value {
        json!({
            "rank": self.rank,
            "world_size": self.world_size,
            "host": self.host,
        })
    }

    pub fn from_record(v: &serde_json::Value) -> Option<Self> {
        Some(Self {
            rank: v.get("rank")?.as_i64()? as i32,
            world_size: v.get("world_size")?.as_i64()? as i32,
            host: v.get("host")?.as_str()?.to_string(),
        })
    }
}

/// One line of a trace file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRecord {
    Header(TraceHeader),
    Topology(Vec<String>),
    Event(CallEvent),
    Seal { n_events: u64 },
}

impl TraceRecord {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TraceRecord::Header(h) => h.trace_record(),
            TraceRecord::Topology(hosts) => json!({ "topology": hosts }),
            TraceRecord::Event(ev) => ev.trace_record(),
            TraceRecord::Seal { n_events } => json!({ "seal": { "n_events": n_events } }),
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let v: serde_json::Value = serde_json::from_str(line).ok()?;
        if v.get("seq").is_some() {
            return CallEvent::from_record(&v).map(TraceRecord::Event);
        }
        if let Some(topo) = v.get("topology") {
            let hosts = topo
                .as_array()?
                .iter()
                .map(|h| h.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()?;
            return Some(TraceRecord::Topology(hosts));
        }
        if let Some(seal) = v.get("seal") {
            return Some(TraceRecord::Seal {
                n_events: seal.get("n_events")?.as_u64()?,
            });
        }
        TraceHeader::from_record(&v).map(TraceRecord::Header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> CallEvent {
        CallEvent {
            seq: 7,
            op: Opcode::Bcast,
            comm: 0,
            sig: ArgSignature {
                count: Some(1),
                datatype: Some(DatatypeId::Int),
                peer_or_root: Some(0),
                tag: None,
            },
            ts_ns: 123456,
            checked: true,
        }
    }

    #[test]
    fn event_record_round_trip() {
        let ev = sample_event();
        let line = ev.trace_record().to_string();
        let parsed = TraceRecord::parse(&line).unwrap();
        assert_eq!(parsed, TraceRecord::Event(ev));
    }

    #[test]
    fn barrier_omits_insignificant_fields() {
        let ev = CallEvent {
            seq: 0,
            op: Opcode::Barrier,
            comm: 0,
            sig: ArgSignature::default(),
            ts_ns: 1,
            checked: true,
        };
        let record = ev.trace_record();
        assert!(record.get("count").is_none());
        assert!(record.get("datatype").is_none());
        assert_eq!(TraceRecord::parse(&record.to_string()), Some(TraceRecord::Event(ev)));
    }

    #[test]
    fn unchecked_flag_survives() {
        let mut ev = sample_event();
        ev.checked = false;
        let line = ev.trace_record().to_string();
        match TraceRecord::parse(&line).unwrap() {
            TraceRecord::Event(parsed) => assert!(!parsed.checked),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn header_and_seal_round_trip() {
        let header = TraceHeader {
            rank: 2,
            world_size: 4,
            host: String::from("node-2"),
        };
        let line = TraceRecord::Header(header.clone()).to_json().to_string();
        assert_eq!(TraceRecord::parse(&line), Some(TraceRecord::Header(header)));

        let line = TraceRecord::Seal { n_events: 12 }.to_json().to_string();
        assert_eq!(TraceRecord::parse(&line), Some(TraceRecord::Seal { n_events: 12 }));
    }

    #[test]
    fn topology_round_trip() {
        let hosts = vec![String::from("a"), String::from("b")];
        let line = TraceRecord::Topology(hosts.clone()).to_json().to_string();
        assert_eq!(TraceRecord::parse(&line), Some(TraceRecord::Topology(hosts)));
    }

    #[test]
    fn garbage_line_rejected() {
        assert_eq!(TraceRecord::parse("{\"seq\": 1"), None);
        assert_eq!(TraceRecord::parse(""), None);
        assert_eq!(TraceRecord::parse("{\"unrelated\": 3}"), None);
    }

    #[test]
    fn shape_match_ignores_tag_and_peer() {
        let a = ArgSignature {
            count: Some(20),
            datatype: Some(DatatypeId::Int),
            peer_or_root: Some(0),
            tag: Some(0),
        };
        let mut b = a.clone();
        b.tag = Some(9);
        b.peer_or_root = Some(3);
        assert!(a.shape_matches(&b));
        b.count = Some(30);
        assert!(!a.shape_matches(&b));
    }
}
