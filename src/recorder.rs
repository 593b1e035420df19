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

//! Append-only per-process trace recorder.
//!
//! The append path assigns sequence numbers and stages events under one
//! short-lived lock; a flusher thread drains the staging buffer to the
//! trace file on the configured cadence. Forced dumps arrive through a
//! lock-free control fifo so a signal handler can request one without
//! taking a lock. Recording failures degrade observability only; they are
//! surfaced to the caller for logging, never to the traced program.

use crate::config::Config;
use crate::event::{ArgSignature, CallEvent, TraceHeader, TraceRecord};
use crate::registry::Opcode;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use log::warn;
use static_assertions::const_assert;

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const CTRL_FIFO_SZ: usize = 64;
const_assert!(CTRL_FIFO_SZ.is_power_of_two());

/// Flusher polling cadence; bounds forced-dump latency.
const POLL_MS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// every append is written and flushed before the call is forwarded
    EveryEvent,
    /// batched writes, synced on the given interval
    Buffered(Duration),
}

impl FlushPolicy {
    pub fn from_config(config: &Config) -> Self {
        if config.flush_every_event {
            FlushPolicy::EveryEvent
        } else {
            FlushPolicy::Buffered(config.flush_interval)
        }
    }
}

#[derive(Debug)]
pub enum RecordError {
    Sealed,
    Io(std::io::Error),
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Sealed => write!(f, "trace is sealed"),
            RecordError::Io(e) => write!(f, "trace write failed: {}", e),
        }
    }
}

#[derive(Debug)]
enum CtrlMessage {
    ForceDump,
    Seal,
}

#[derive(Debug, Default)]
struct EventBuffer {
    next_seq: u64,
    pending: Vec<CallEvent>,
}

#[derive(Debug)]
struct TraceWriter {
    out: BufWriter<File>,
}

impl TraceWriter {
    fn write_record(&mut self, record: &serde_json::Value) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_data()
    }
}

#[derive(Debug)]
struct Shared {
    buffer: Mutex<EventBuffer>,
    writer: Mutex<TraceWriter>,
    ctrl: ArrayQueue<CtrlMessage>,
    io_errors: CachePadded<AtomicU64>,
}

impl Shared {
    /// Moves all staged events to the file, in sequence order. The writer
    /// lock is taken before the buffer snapshot so concurrent drains
    /// cannot write their batches out of order.
    fn drain(&self) {
        let mut writer = self.writer.lock().unwrap();
        let pending = {
            let mut buffer = self.buffer.lock().unwrap();
            std::mem::take(&mut buffer.pending)
        };
        if pending.is_empty() {
            return;
        }
        let mut failed = 0u64;
        for ev in &pending {
            if writer.write_record(&ev.trace_record()).is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            self.io_errors.fetch_add(failed, Ordering::Relaxed);
            warn!("failed to write {} trace event(s); continuing degraded", failed);
        }
    }

    fn sync(&self) {
        if let Err(e) = self.writer.lock().unwrap().sync() {
            self.io_errors.fetch_add(1, Ordering::Relaxed);
            warn!("trace sync failed: {}", e);
        }
    }
}

#[derive(Debug)]
pub struct Recorder {
    shared: Arc<Shared>,
    policy: FlushPolicy,
    sealed: AtomicBool,
    flusher: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Recorder {
    /// Opens the trace file, writes the header record, and starts the
    /// flusher thread.
    pub fn create(
        path: &Path,
        policy: FlushPolicy,
        header: &TraceHeader,
    ) -> std::io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = TraceWriter {
            out: BufWriter::new(file),
        };
        writer.write_record(&header.trace_record())?;
        writer.sync()?;

        let shared = Arc::new(Shared {
            buffer: Mutex::new(EventBuffer::default()),
            writer: Mutex::new(writer),
            ctrl: ArrayQueue::new(CTRL_FIFO_SZ),
            io_errors: CachePadded::new(AtomicU64::new(0)),
        });

        let flush_interval = match policy {
            FlushPolicy::EveryEvent => Duration::from_millis(POLL_MS),
            FlushPolicy::Buffered(interval) => interval,
        };
        let worker = shared.clone();
        let handle = std::thread::Builder::new()
            .name(String::from("collcheck-flush"))
            .spawn(move || flusher_loop(worker, flush_interval))?;

        Ok(Self {
            shared,
            policy,
            sealed: AtomicBool::new(false),
            flusher: Mutex::new(Some(handle)),
        })
    }

    /// Writes a non-event record (topology) ahead of the event stream.
    /// Callers must not have appended events yet.
    pub fn append_preamble(&self, record: &TraceRecord) -> std::io::Result<()> {
        let mut writer = self.shared.writer.lock().unwrap();
        writer.write_record(&record.to_json())?;
        writer.sync()
    }

    /// Stages one call event; returns its sequence number. Sequence
    /// numbers are strictly increasing with no gaps, also when multiple
    /// threads append concurrently.
    pub fn append(
        &self,
        op: Opcode,
        comm: u32,
        sig: ArgSignature,
        checked: bool,
        ts_ns: u64,
    ) -> Result<u64, RecordError> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(RecordError::Sealed);
        }
        let seq = {
            let mut buffer = self.shared.buffer.lock().unwrap();
            let seq = buffer.next_seq;
            buffer.next_seq += 1;
            buffer.pending.push(CallEvent {
                seq,
                op,
                comm,
                sig,
                ts_ns,
                checked,
            });
            seq
        };
        if self.policy == FlushPolicy::EveryEvent {
            self.shared.drain();
            self.shared.sync();
        }
        Ok(seq)
    }

    /// Requests an immediate drain + sync. Lock-free; invocable from a
    /// signal handler while the traced program is wedged inside a
    /// collective.
    pub fn force_dump(&self) {
        let _ = self.shared.ctrl.push(CtrlMessage::ForceDump);
    }

    /// Drains everything, writes the seal record, and stops the flusher.
    /// A second seal is a no-op: the trace file is never reopened for
    /// writing.
    pub fn seal(&self) {
        if self.sealed.swap(true, Ordering::AcqRel) {
            warn!("trace already sealed; ignoring");
            return;
        }
        while self.shared.ctrl.push(CtrlMessage::Seal).is_err() {
            std::thread::sleep(Duration::from_millis(POLL_MS));
        }
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn io_errors(&self) -> u64 {
        self.shared.io_errors.load(Ordering::Relaxed)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if !self.is_sealed() {
            self.seal();
        }
    }
}

fn flusher_loop(shared: Arc<Shared>, flush_interval: Duration) {
    let mut last_sync = Instant::now();
    loop {
        std::thread::sleep(Duration::from_millis(POLL_MS));

        let mut dump = false;
        let mut seal = false;
        while let Some(msg) = shared.ctrl.pop() {
            match msg {
                CtrlMessage::ForceDump => dump = true,
                CtrlMessage::Seal => seal = true,
            }
        }

        shared.drain();
        if dump || seal || last_sync.elapsed() >= flush_interval {
            shared.sync();
            last_sync = Instant::now();
        }

        if seal {
            let mut writer = shared.writer.lock().unwrap();
            let n_events = shared.buffer.lock().unwrap().next_seq;
            if let Err(e) = writer
                .write_record(&TraceRecord::Seal { n_events }.to_json())
                .and_then(|()| writer.sync())
            {
                warn!("failed to write seal record: {}", e);
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::Rng as _;

    fn temp_trace_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "collcheck-test-{}-{}.trace",
            std::process::id(),
            name
        ))
    }

    fn test_header() -> TraceHeader {
        TraceHeader {
            rank: 0,
            world_size: 1,
            host: String::from("testhost"),
        }
    }

    fn read_records(path: &Path) -> Vec<TraceRecord> {
        let data = std::fs::read_to_string(path).unwrap();
        data.lines().map(|l| TraceRecord::parse(l).unwrap()).collect()
    }

    fn event_seqs(records: &[TraceRecord]) -> Vec<u64> {
        records
            .iter()
            .filter_map(|r| match r {
                TraceRecord::Event(ev) => Some(ev.seq),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn sequence_gap_free_under_concurrent_append() {
        const N_THREADS: usize = 4;
        const PER_THREAD: usize = 250;

        let path = temp_trace_path("concurrent");
        let recorder = Recorder::create(
            &path,
            FlushPolicy::Buffered(Duration::from_millis(20)),
            &test_header(),
        )
        .unwrap();

        std::thread::scope(|s| {
            for _ in 0..N_THREADS {
                s.spawn(|| {
                    let mut rng = rand::rng();
                    for _ in 0..PER_THREAD {
                        recorder
                            .append(
                                Opcode::Barrier,
                                0,
                                ArgSignature::default(),
                                true,
                                rng.random_range(0..1_000_000),
                            )
                            .unwrap();
                        if rng.random_range(0..8) == 0 {
                            std::thread::yield_now();
                        }
                    }
                });
            }
        });
        recorder.seal();

        let records = read_records(&path);
        let seqs = event_seqs(&records);
        assert_eq!(seqs.len(), N_THREADS * PER_THREAD);
        for (i, seq) in seqs.iter().enumerate() {
            assert_eq!(*seq, i as u64);
        }
        assert!(matches!(
            records.last(),
            Some(TraceRecord::Seal { n_events }) if *n_events == (N_THREADS * PER_THREAD) as u64
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn forced_dump_leaves_readable_unsealed_trace() {
        let path = temp_trace_path("dump");
        let recorder = Recorder::create(
            &path,
            FlushPolicy::Buffered(Duration::from_secs(3600)),
            &test_header(),
        )
        .unwrap();

        for i in 0..10 {
            recorder
                .append(Opcode::Bcast, 0, ArgSignature::default(), true, i)
                .unwrap();
        }
        recorder.force_dump();
        std::thread::sleep(Duration::from_millis(100));

        // file is complete up to the dump, with no seal record
        let records = read_records(&path);
        assert_eq!(event_seqs(&records).len(), 10);
        assert!(!records.iter().any(|r| matches!(r, TraceRecord::Seal { .. })));

        recorder.seal();
        let records = read_records(&path);
        assert!(matches!(records.last(), Some(TraceRecord::Seal { n_events: 10 })));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn every_event_policy_is_durable_immediately() {
        let path = temp_trace_path("every-event");
        let recorder =
            Recorder::create(&path, FlushPolicy::EveryEvent, &test_header()).unwrap();
        recorder
            .append(Opcode::Barrier, 0, ArgSignature::default(), true, 1)
            .unwrap();

        let records = read_records(&path);
        assert_eq!(event_seqs(&records), vec![0]);

        recorder.seal();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn seal_twice_is_noop_and_append_after_seal_fails() {
        let path = temp_trace_path("seal-twice");
        let recorder = Recorder::create(
            &path,
            FlushPolicy::Buffered(Duration::from_millis(20)),
            &test_header(),
        )
        .unwrap();
        recorder
            .append(Opcode::Barrier, 0, ArgSignature::default(), true, 1)
            .unwrap();
        recorder.seal();
        recorder.seal();

        assert!(matches!(
            recorder.append(Opcode::Barrier, 0, ArgSignature::default(), true, 2),
            Err(RecordError::Sealed)
        ));

        let records = read_records(&path);
        let seals = records
            .iter()
            .filter(|r| matches!(r, TraceRecord::Seal { .. }))
            .count();
        assert_eq!(seals, 1);
        std::fs::remove_file(&path).unwrap();
    }
}
