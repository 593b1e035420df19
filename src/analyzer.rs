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

//! Cross-rank trace alignment.
//!
//! Alignment is purely logical: per communicator, every participating
//! rank's collective events advance in lockstep by call index, never by
//! timestamp. Point-to-point traffic is matched pairwise per
//! (source, destination) channel. The pass is side-effect free and
//! restartable; traces are read-only inputs.

use crate::event::{ArgSignature, CallEvent};
use crate::registry::{self, Opcode};
use crate::trace::Trace;

use std::collections::{BTreeMap, BTreeSet};

/// Interned id of the world communicator, by construction of the
/// recording side.
pub const WORLD_COMM: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallShape {
    pub op: Opcode,
    pub sig: ArgSignature,
}

impl CallShape {
    fn of(ev: &CallEvent) -> Self {
        Self {
            op: ev.op,
            sig: ev.sig.clone(),
        }
    }

    /// Agreement on the fields the registry marks significant. The root
    /// operand only participates for rooted collectives; the peer operand
    /// of p2p calls identifies the channel and is never compared here.
    fn agrees_with(&self, other: &CallShape) -> bool {
        if self.op != other.op {
            return false;
        }
        if !self.sig.shape_matches(&other.sig) {
            return false;
        }
        if registry::shape(self.op).has_root && self.sig.peer_or_root != other.sig.peer_or_root {
            return false;
        }
        true
    }
}

impl std::fmt::Display for CallShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.op.name(), self.sig)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedCall {
    Call(CallShape),
    /// the rank never made a call at this position
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankObservation {
    pub rank: i32,
    pub observed: ObservedCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceKind {
    /// a subset of ranks entered a collective the rest never called: the
    /// canonical deadlock signature
    MissingParticipant,
    /// all participants called, but with conflicting shapes
    ArgumentMismatch,
    /// send/recv left without a counterpart at trace end; may be a hang
    /// or merely an early exit
    UnmatchedPointToPoint,
    /// rank(s) never completed the startup topology exchange; nothing
    /// after that point is comparable
    TopologyIncomplete,
}

impl DivergenceKind {
    pub fn name(&self) -> &'static str {
        match self {
            DivergenceKind::MissingParticipant => "missing_participant",
            DivergenceKind::ArgumentMismatch => "argument_mismatch",
            DivergenceKind::UnmatchedPointToPoint => "unmatched_point_to_point",
            DivergenceKind::TopologyIncomplete => "topology_incomplete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub kind: DivergenceKind,
    pub comm: u32,
    /// per-communicator logical step for collectives; pair index within
    /// the channel for point-to-point kinds
    pub step: usize,
    /// the call the non-deviating participants agree on, where one exists
    pub expected: Option<CallShape>,
    /// the deviating ranks and what each of them did instead
    pub observed: Vec<RankObservation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub divergences: Vec<Divergence>,
    pub analyzed_ranks: Vec<i32>,
}

impl Analysis {
    pub fn is_consistent(&self) -> bool {
        self.divergences.is_empty()
    }
}

pub fn analyze(traces: &[Trace]) -> Analysis {
    let mut traces: Vec<&Trace> = traces.iter().collect();
    traces.sort_by_key(|t| t.rank);

    let analyzed_ranks: Vec<i32> = traces.iter().map(|t| t.rank).collect();
    let mut divergences = Vec::new();

    check_topology(&traces, &mut divergences);
    align_collectives(&traces, &mut divergences);
    match_point_to_point(&traces, &mut divergences);

    divergences.sort_by_key(|d| (d.comm, d.step));
    Analysis {
        divergences,
        analyzed_ranks,
    }
}

fn check_topology(traces: &[&Trace], divergences: &mut Vec<Divergence>) {
    let missing: Vec<i32> = traces
        .iter()
        .filter(|t| t.topology.is_none())
        .map(|t| t.rank)
        .collect();
    if traces.is_empty() || missing.is_empty() {
        return;
    }
    divergences.push(Divergence {
        kind: DivergenceKind::TopologyIncomplete,
        comm: WORLD_COMM,
        step: 0,
        expected: None,
        observed: missing
            .into_iter()
            .map(|rank| RankObservation {
                rank,
                observed: ObservedCall::Absent,
            })
            .collect(),
    });
}

/// Most common shape, ties broken by first occurrence. Callers guarantee
/// a non-empty input.
fn plurality_shape(shapes: &[CallShape]) -> CallShape {
    let mut best = 0;
    let mut best_count = 0;
    for (i, shape) in shapes.iter().enumerate() {
        let count = shapes.iter().filter(|s| s.agrees_with(shape)).count();
        if count > best_count {
            best = i;
            best_count = count;
        }
    }
    shapes[best].clone()
}

fn align_collectives(traces: &[&Trace], divergences: &mut Vec<Divergence>) {
    let comms: BTreeSet<u32> = traces
        .iter()
        .flat_map(|t| t.events.iter())
        .filter(|ev| ev.checked && ev.op.is_collective())
        .map(|ev| ev.comm)
        .collect();

    for comm in comms {
        // per-rank view of this communicator's collective call sequence
        let streams: Vec<(i32, Vec<&CallEvent>)> = traces
            .iter()
            .map(|t| {
                let stream = t
                    .events
                    .iter()
                    .filter(|ev| ev.comm == comm && ev.checked && ev.op.is_collective())
                    .collect::<Vec<_>>();
                (t.rank, stream)
            })
            .collect();

        // Derived-communicator membership is unknowable from traces, so
        // participation means "referenced it"; the world communicator
        // spans every analyzed rank.
        let participants: Vec<&(i32, Vec<&CallEvent>)> = streams
            .iter()
            .filter(|(_, s)| comm == WORLD_COMM || !s.is_empty())
            .collect();
        if participants.len() < 2 {
            continue;
        }

        for step in 0.. {
            let row: Vec<(i32, Option<&CallEvent>)> = participants
                .iter()
                .map(|(rank, stream)| (*rank, stream.get(step).copied()))
                .collect();

            if row.iter().all(|(_, ev)| ev.is_none()) {
                break;
            }

            if row.iter().any(|(_, ev)| ev.is_none()) {
                let present: Vec<CallShape> = row
                    .iter()
                    .filter_map(|(_, ev)| ev.map(CallShape::of))
                    .collect();
                divergences.push(Divergence {
                    kind: DivergenceKind::MissingParticipant,
                    comm,
                    step,
                    expected: Some(plurality_shape(&present)),
                    observed: row
                        .iter()
                        .filter(|(_, ev)| ev.is_none())
                        .map(|(rank, _)| RankObservation {
                            rank: *rank,
                            observed: ObservedCall::Absent,
                        })
                        .collect(),
                });
                break;
            }

            let shapes: Vec<CallShape> = row
                .iter()
                .map(|(_, ev)| CallShape::of(ev.unwrap()))
                .collect();
            let expected = plurality_shape(&shapes);
            let deviating: Vec<RankObservation> = row
                .iter()
                .zip(shapes.iter())
                .filter(|(_, shape)| !shape.agrees_with(&expected))
                .map(|((rank, _), shape)| RankObservation {
                    rank: *rank,
                    observed: ObservedCall::Call(shape.clone()),
                })
                .collect();
            if !deviating.is_empty() {
                divergences.push(Divergence {
                    kind: DivergenceKind::ArgumentMismatch,
                    comm,
                    step,
                    expected: Some(expected),
                    observed: deviating,
                });
                break;
            }
        }
    }
}

fn match_point_to_point(traces: &[&Trace], divergences: &mut Vec<Divergence>) {
    // (comm, src, dst) -> FIFO call lists on each side of the channel
    let mut sends: BTreeMap<(u32, i32, i32), Vec<&CallEvent>> = BTreeMap::new();
    let mut recvs: BTreeMap<(u32, i32, i32), Vec<&CallEvent>> = BTreeMap::new();

    for t in traces {
        for ev in &t.events {
            if !ev.checked {
                continue;
            }
            match ev.op {
                Opcode::Send => {
                    if let Some(dst) = ev.sig.peer_or_root {
                        sends.entry((ev.comm, t.rank, dst)).or_default().push(ev);
                    }
                }
                Opcode::Recv => {
                    if let Some(src) = ev.sig.peer_or_root {
                        recvs.entry((ev.comm, src, t.rank)).or_default().push(ev);
                    }
                }
                _ => {}
            }
        }
    }

    let channels: BTreeSet<(u32, i32, i32)> =
        sends.keys().chain(recvs.keys()).copied().collect();
    const EMPTY: &[&CallEvent] = &[];

    for channel in channels {
        let (comm, src, dst) = channel;
        // a channel to a rank outside the analyzed set cannot be judged
        if !traces.iter().any(|t| t.rank == src) || !traces.iter().any(|t| t.rank == dst) {
            continue;
        }
        let s = sends.get(&channel).map_or(EMPTY, Vec::as_slice);
        let r = recvs.get(&channel).map_or(EMPTY, Vec::as_slice);

        let paired = s.len().min(r.len());
        let mut diverged = false;
        for k in 0..paired {
            if !s[k].sig.shape_matches(&r[k].sig) {
                divergences.push(Divergence {
                    kind: DivergenceKind::ArgumentMismatch,
                    comm,
                    step: k,
                    expected: Some(CallShape::of(s[k])),
                    observed: vec![RankObservation {
                        rank: dst,
                        observed: ObservedCall::Call(CallShape::of(r[k])),
                    }],
                });
                diverged = true;
                break;
            }
        }
        if diverged {
            continue;
        }

        if s.len() != r.len() {
            let (rank, leftover) = if s.len() > r.len() {
                (src, s[paired])
            } else {
                (dst, r[paired])
            };
            divergences.push(Divergence {
                kind: DivergenceKind::UnmatchedPointToPoint,
                comm,
                step: paired,
                expected: None,
                observed: vec![RankObservation {
                    rank,
                    observed: ObservedCall::Call(CallShape::of(leftover)),
                }],
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DatatypeId;
    use crate::topology::Topology;

    fn ev(seq: u64, op: Opcode, comm: u32, count: i64, peer_or_root: i32) -> CallEvent {
        let shape = registry::shape(op);
        CallEvent {
            seq,
            op,
            comm,
            sig: ArgSignature {
                count: shape.has_count.then_some(count),
                datatype: shape.has_datatype.then_some(DatatypeId::Int),
                peer_or_root: (shape.has_root
                    || shape.peer != registry::PeerRole::None)
                    .then_some(peer_or_root),
                tag: shape.peer.ne(&registry::PeerRole::None).then_some(0),
            },
            ts_ns: seq * 100,
            checked: true,
        }
    }

    fn trace(rank: i32, world: i32, ops: Vec<CallEvent>) -> Trace {
        let mut events = ops;
        for (i, ev) in events.iter_mut().enumerate() {
            ev.seq = i as u64;
        }
        Trace {
            rank,
            world_size: world,
            host: format!("node-{}", rank),
            topology: Some(Topology {
                hosts: (0..world).map(|r| format!("node-{}", r)).collect(),
            }),
            events,
            sealed: true,
        }
    }

    #[test]
    fn fault_free_run_is_consistent() {
        let ops = |_rank: i32| {
            vec![
                ev(0, Opcode::Barrier, 0, 0, 0),
                ev(1, Opcode::Bcast, 0, 1, 0),
                ev(2, Opcode::Allreduce, 0, 64, 0),
            ]
        };
        let traces: Vec<Trace> = (0..3).map(|r| trace(r, 3, ops(r))).collect();
        let analysis = analyze(&traces);
        assert!(analysis.is_consistent(), "{:?}", analysis.divergences);
        assert_eq!(analysis.analyzed_ranks, vec![0, 1, 2]);
    }

    #[test]
    fn skipped_broadcast_is_missing_participant() {
        // one rank sleeps through the broadcast: the deadlock exemplar
        let full = vec![ev(0, Opcode::Barrier, 0, 0, 0), ev(1, Opcode::Bcast, 0, 1, 0)];
        let short = vec![ev(0, Opcode::Barrier, 0, 0, 0)];
        let traces = vec![
            trace(0, 4, full.clone()),
            trace(1, 4, full.clone()),
            trace(2, 4, short),
            trace(3, 4, full),
        ];
        let analysis = analyze(&traces);
        assert_eq!(analysis.divergences.len(), 1);
        let d = &analysis.divergences[0];
        assert_eq!(d.kind, DivergenceKind::MissingParticipant);
        assert_eq!(d.comm, WORLD_COMM);
        assert_eq!(d.step, 1);
        assert_eq!(d.expected.as_ref().unwrap().op, Opcode::Bcast);
        assert_eq!(d.observed.len(), 1);
        assert_eq!(d.observed[0].rank, 2);
        assert_eq!(d.observed[0].observed, ObservedCall::Absent);
    }

    #[test]
    fn collective_count_mismatch_names_deviating_rank() {
        let traces = vec![
            trace(0, 3, vec![ev(0, Opcode::Bcast, 0, 10, 0)]),
            trace(1, 3, vec![ev(0, Opcode::Bcast, 0, 10, 0)]),
            trace(2, 3, vec![ev(0, Opcode::Bcast, 0, 20, 0)]),
        ];
        let analysis = analyze(&traces);
        assert_eq!(analysis.divergences.len(), 1);
        let d = &analysis.divergences[0];
        assert_eq!(d.kind, DivergenceKind::ArgumentMismatch);
        assert_eq!(d.step, 0);
        assert_eq!(d.expected.as_ref().unwrap().sig.count, Some(10));
        assert_eq!(d.observed.len(), 1);
        assert_eq!(d.observed[0].rank, 2);
        match &d.observed[0].observed {
            ObservedCall::Call(shape) => assert_eq!(shape.sig.count, Some(20)),
            other => panic!("unexpected observation {:?}", other),
        }
    }

    #[test]
    fn root_disagreement_is_a_divergence() {
        let traces = vec![
            trace(0, 2, vec![ev(0, Opcode::Bcast, 0, 1, 0)]),
            trace(1, 2, vec![ev(0, Opcode::Bcast, 0, 1, 1)]),
        ];
        let analysis = analyze(&traces);
        assert_eq!(analysis.divergences.len(), 1);
        assert_eq!(analysis.divergences[0].kind, DivergenceKind::ArgumentMismatch);
    }

    #[test]
    fn only_earliest_divergence_per_communicator() {
        // two bad steps on the same communicator; only step 0 reported
        let traces = vec![
            trace(
                0,
                2,
                vec![ev(0, Opcode::Bcast, 0, 1, 0), ev(1, Opcode::Allreduce, 0, 5, 0)],
            ),
            trace(
                1,
                2,
                vec![ev(0, Opcode::Bcast, 0, 2, 0), ev(1, Opcode::Allreduce, 0, 9, 0)],
            ),
        ];
        let analysis = analyze(&traces);
        assert_eq!(analysis.divergences.len(), 1);
        assert_eq!(analysis.divergences[0].step, 0);
    }

    #[test]
    fn mismatched_transfer_size_is_argument_divergence() {
        // the 20-vs-30 send/recv exemplar
        let traces = vec![
            trace(
                0,
                3,
                vec![
                    ev(0, Opcode::Recv, 0, 20, 1),
                    ev(1, Opcode::Recv, 0, 20, 2),
                ],
            ),
            trace(1, 3, vec![ev(0, Opcode::Send, 0, 30, 0)]),
            trace(2, 3, vec![ev(0, Opcode::Send, 0, 20, 0)]),
        ];
        let analysis = analyze(&traces);
        assert_eq!(analysis.divergences.len(), 1);
        let d = &analysis.divergences[0];
        assert_eq!(d.kind, DivergenceKind::ArgumentMismatch);
        assert_eq!(d.step, 0);
        assert_eq!(d.expected.as_ref().unwrap().sig.count, Some(30));
        assert_eq!(d.observed[0].rank, 0);
        match &d.observed[0].observed {
            ObservedCall::Call(shape) => assert_eq!(shape.sig.count, Some(20)),
            other => panic!("unexpected observation {:?}", other),
        }
    }

    #[test]
    fn unmatched_send_is_its_own_kind() {
        let traces = vec![
            trace(0, 2, Vec::new()),
            trace(1, 2, vec![ev(0, Opcode::Send, 0, 8, 0)]),
        ];
        let analysis = analyze(&traces);
        assert_eq!(analysis.divergences.len(), 1);
        let d = &analysis.divergences[0];
        assert_eq!(d.kind, DivergenceKind::UnmatchedPointToPoint);
        assert_eq!(d.observed[0].rank, 1);
    }

    #[test]
    fn derived_communicators_align_independently() {
        // comm 1 is used by ranks 0 and 1 only; rank 2 never references
        // it and is not blamed
        let traces = vec![
            trace(
                0,
                3,
                vec![ev(0, Opcode::Barrier, 0, 0, 0), ev(1, Opcode::Allreduce, 1, 4, 0)],
            ),
            trace(
                1,
                3,
                vec![ev(0, Opcode::Barrier, 0, 0, 0), ev(1, Opcode::Allreduce, 1, 4, 0)],
            ),
            trace(2, 3, vec![ev(0, Opcode::Barrier, 0, 0, 0)]),
        ];
        let analysis = analyze(&traces);
        assert!(analysis.is_consistent(), "{:?}", analysis.divergences);
    }

    #[test]
    fn divergences_on_different_communicators_reported_independently() {
        let traces = vec![
            trace(
                0,
                2,
                vec![ev(0, Opcode::Bcast, 0, 1, 0), ev(1, Opcode::Allreduce, 1, 4, 0)],
            ),
            trace(
                1,
                2,
                vec![ev(0, Opcode::Bcast, 0, 2, 0), ev(1, Opcode::Allreduce, 1, 9, 0)],
            ),
        ];
        let analysis = analyze(&traces);
        assert_eq!(analysis.divergences.len(), 2);
        assert_eq!(analysis.divergences[0].comm, 0);
        assert_eq!(analysis.divergences[1].comm, 1);
    }

    #[test]
    fn header_only_trace_flags_topology_as_earliest() {
        let mut hung = trace(1, 2, Vec::new());
        hung.topology = None;
        hung.sealed = false;
        let traces = vec![trace(0, 2, vec![ev(0, Opcode::Barrier, 0, 0, 0)]), hung];
        let analysis = analyze(&traces);
        assert_eq!(analysis.divergences[0].kind, DivergenceKind::TopologyIncomplete);
        assert_eq!(analysis.divergences[0].observed[0].rank, 1);
    }

    #[test]
    fn unchecked_events_are_skipped() {
        let mut wildcard = ev(0, Opcode::Recv, 0, 8, -1);
        wildcard.checked = false;
        let traces = vec![trace(0, 2, vec![wildcard]), trace(1, 2, Vec::new())];
        let analysis = analyze(&traces);
        assert!(analysis.is_consistent());
    }

    #[test]
    fn analysis_is_idempotent() {
        let traces = vec![
            trace(0, 2, vec![ev(0, Opcode::Bcast, 0, 10, 0)]),
            trace(1, 2, vec![ev(0, Opcode::Bcast, 0, 20, 0)]),
        ];
        assert_eq!(analyze(&traces), analyze(&traces));
    }
}
