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

//! Diagnosis rendering.
//!
//! One report carries both representations of the same analysis: a
//! structured JSON document for machines and a `Display` for humans.
//! Rendering is pure; running it twice over unchanged inputs produces
//! identical output.

use crate::analyzer::{Analysis, CallShape, Divergence, ObservedCall};
use crate::trace::TraceLoadError;

use serde_json::json;

pub const CONSISTENCY_CAVEAT: &str = "absence of divergence does not prove absence of bugs; \
     data corruption with identical counts and datatypes is invisible to call tracing";

#[derive(Debug)]
pub struct Report<'a> {
    analysis: &'a Analysis,
    load_errors: &'a [TraceLoadError],
}

impl<'a> Report<'a> {
    pub fn new(analysis: &'a Analysis, load_errors: &'a [TraceLoadError]) -> Self {
        Self {
            analysis,
            load_errors,
        }
    }

    /// 0 = consistent, 1 = divergence found, 2 = analyzer-level error
    /// (some rank's trace missing or corrupt; divergences among the
    /// remaining ranks are still reported).
    pub fn exit_code(&self) -> i32 {
        if !self.load_errors.is_empty() {
            2
        } else if !self.analysis.is_consistent() {
            1
        } else {
            0
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut json = json!({
            "consistent": self.analysis.is_consistent(),
            "analyzed_ranks": self.analysis.analyzed_ranks,
            "divergences": self
                .analysis
                .divergences
                .iter()
                .map(divergence_json)
                .collect::<Vec<_>>(),
        });
        if !self.load_errors.is_empty() {
            json["excluded"] = self
                .load_errors
                .iter()
                .map(|e| json!(e.to_string()))
                .collect();
            json["reduced_coverage"] = json!(true);
        }
        if self.analysis.is_consistent() {
            json["caveat"] = json!(CONSISTENCY_CAVEAT);
        }
        json
    }
}

fn shape_json(shape: &CallShape) -> serde_json::Value {
    let mut json = json!({ "op": shape.op.name() });
    if let Some(count) = shape.sig.count {
        json["count"] = json!(count);
    }
    if let Some(dt) = shape.sig.datatype {
        json["datatype"] = json!(dt.name());
    }
    if let Some(p) = shape.sig.peer_or_root {
        json["peer_or_root"] = json!(p);
    }
    json
}

fn divergence_json(d: &Divergence) -> serde_json::Value {
    let mut json = json!({
        "kind": d.kind.name(),
        "comm": d.comm,
        "step": d.step,
        "ranks": d.observed.iter().map(|o| o.rank).collect::<Vec<_>>(),
        "observed": d
            .observed
            .iter()
            .map(|o| match &o.observed {
                ObservedCall::Call(shape) => {
                    let mut obs = shape_json(shape);
                    obs["rank"] = json!(o.rank);
                    obs
                }
                ObservedCall::Absent => json!({ "rank": o.rank, "absent": true }),
            })
            .collect::<Vec<_>>(),
    });
    if let Some(expected) = &d.expected {
        json["expected"] = shape_json(expected);
    }
    json
}

impl std::fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use crate::analyzer::DivergenceKind::*;

        if self.analysis.is_consistent() {
            writeln!(
                f,
                "collcheck: no divergence across ranks {:?}",
                self.analysis.analyzed_ranks
            )?;
            writeln!(f, "note: {}", CONSISTENCY_CAVEAT)?;
        } else {
            writeln!(
                f,
                "collcheck: {} divergence(s) found",
                self.analysis.divergences.len()
            )?;
            for (i, d) in self.analysis.divergences.iter().enumerate() {
                let kind = match d.kind {
                    MissingParticipant => "missing participant (deadlock signature)",
                    ArgumentMismatch => "argument mismatch",
                    UnmatchedPointToPoint => "unmatched point-to-point",
                    TopologyIncomplete => "startup topology exchange never completed",
                };
                writeln!(
                    f,
                    "[{}] {} on communicator {} at step {}",
                    i + 1,
                    kind,
                    d.comm,
                    d.step
                )?;
                if let Some(expected) = &d.expected {
                    writeln!(f, "    expected: {}", expected)?;
                }
                for o in &d.observed {
                    match &o.observed {
                        ObservedCall::Call(shape) => {
                            writeln!(f, "    rank {}: called {}", o.rank, shape)?
                        }
                        ObservedCall::Absent => writeln!(f, "    rank {}: absent", o.rank)?,
                    }
                }
            }
        }

        for e in self.load_errors {
            writeln!(f, "warning: {} (rank excluded, coverage reduced)", e)?;
        }
        Ok(())
    }
}
