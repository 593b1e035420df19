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

//! Per-process session state.
//!
//! One `Session` is installed at init interception and lives for the
//! process: config captured once from the environment, rank/size/host,
//! the trace clock, the recorder, and the communicator interner. All
//! recording flows through `record_call`, which consults the registry so
//! the per-operation wrappers stay free of dispatch logic.

use crate::clock::TraceClock;
use crate::config::Config;
use crate::event::ArgSignature;
use crate::mpi_shim::{self, DatatypeTable, MpiComm, MpiDatatype, RealMpi, MPI_SUCCESS};
use crate::recorder::{FlushPolicy, Recorder};
use crate::registry::{self, Opcode, PeerRole};
use crate::topology;

use log::{error, info, warn};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

static SESSION: OnceLock<Session> = OnceLock::new();

/// Raw operand values captured by a foreign wrapper before forwarding.
/// The registry decides which of them are significant for the operation.
#[derive(Debug, Default)]
pub struct RawArgs {
    pub count: Option<i64>,
    pub datatype: Option<MpiDatatype>,
    pub peer_or_root: Option<i32>,
    pub tag: Option<i32>,
    pub comm: Option<MpiComm>,
}

/// Interns process-local communicator handles in first-use order. Id 0 is
/// the world communicator (the topology exchange runs first); under SPMD,
/// bug-free ranks create derived communicators in the same order, which
/// makes the interned ids comparable across ranks.
#[derive(Debug, Default)]
struct CommInterner {
    by_handle: HashMap<usize, u32>,
}

impl CommInterner {
    fn intern(&mut self, handle: usize) -> u32 {
        let next = self.by_handle.len() as u32;
        *self.by_handle.entry(handle).or_insert(next)
    }
}

#[derive(Debug)]
pub struct Session {
    pub config: Config,
    pub rank: i32,
    pub world_size: i32,
    pub host: String,
    clock: TraceClock,
    recorder: Option<Recorder>,
    datatypes: DatatypeTable,
    comms: Mutex<CommInterner>,
    dropped_events: AtomicU32,
}

impl Session {
    fn new(
        config: Config,
        rank: i32,
        world_size: i32,
        host: String,
        recorder: Option<Recorder>,
        datatypes: DatatypeTable,
    ) -> Self {
        Self {
            config,
            rank,
            world_size,
            host,
            clock: TraceClock::default(),
            recorder,
            datatypes,
            comms: Mutex::new(CommInterner::default()),
            dropped_events: AtomicU32::new(0),
        }
    }

    pub fn recorder(&self) -> Option<&Recorder> {
        self.recorder.as_ref()
    }

    fn intern_comm(&self, handle: usize) -> u32 {
        self.comms.lock().unwrap().intern(handle)
    }

    /// The single generic recording routine: build the signature the
    /// registry prescribes and append a pre-forward event. Failures here
    /// degrade observability only and never reach the traced program.
    fn record(&self, op: Opcode, raw: RawArgs) {
        let shape = registry::shape(op);
        let mut checked = op != Opcode::Unknown;
        // a wildcard-source receive cannot be pair-matched offline
        if shape.peer == PeerRole::Source && raw.peer_or_root == Some(mpi_shim::MPI_ANY_SOURCE) {
            checked = false;
        }
        let sig = ArgSignature {
            count: if shape.has_count { raw.count } else { None },
            datatype: if shape.has_datatype {
                raw.datatype.map(|h| self.datatypes.identify(h))
            } else {
                None
            },
            peer_or_root: if shape.has_root || shape.peer != PeerRole::None {
                raw.peer_or_root
            } else {
                None
            },
            tag: raw.tag,
        };
        let comm = raw
            .comm
            .map(|c| self.intern_comm(c as usize))
            .unwrap_or(0);

        let Some(recorder) = self.recorder.as_ref() else {
            return;
        };
        if let Err(e) = recorder.append(op, comm, sig, checked, self.clock.now_ns()) {
            let dropped = self.dropped_events.fetch_add(1, Ordering::Relaxed);
            if dropped == 0 {
                warn!("dropping trace event for {}: {}", op.name(), e);
            }
        }
    }
}

pub fn get() -> Option<&'static Session> {
    SESSION.get()
}

/// Records one intercepted call. A no-op before init interception has
/// installed the session (calls before `MPI_Init` are erroneous in the
/// traced program itself and carry no rank to attribute them to).
pub fn record_call(op: Opcode, raw: RawArgs) {
    if let Some(session) = SESSION.get() {
        session.record(op, raw);
    }
}

/// Builds and installs the process session. Runs inside the init
/// interception, after the real init has succeeded.
pub fn init_handler(real: &RealMpi) {
    let config = Config::from_env();
    crate::install_logger(&config.log_level);

    let Some(world) = mpi_shim::comm_world() else {
        error!("cannot resolve the world communicator; tracing disabled");
        return;
    };
    let mut rank: libc::c_int = 0;
    let mut world_size: libc::c_int = 0;
    // SAFETY: world is the resolved world-communicator handle; out
    // parameters point to live ints.
    let rc = unsafe {
        let rc = (real.comm_rank)(world, &mut rank);
        if rc == MPI_SUCCESS {
            (real.comm_size)(world, &mut world_size)
        } else {
            rc
        }
    };
    if rc != MPI_SUCCESS {
        error!("rank/size query failed ({}); tracing disabled", rc);
        return;
    }
    crate::set_logger_rank(rank);

    let host = topology::local_hostname();
    let header = crate::event::TraceHeader {
        rank,
        world_size,
        host: host.clone(),
    };
    let path = config.trace_path(rank);
    let recorder = match Recorder::create(&path, FlushPolicy::from_config(&config), &header) {
        Ok(recorder) => Some(recorder),
        Err(e) => {
            warn!("cannot open trace file {}: {}; tracing disabled", path.display(), e);
            None
        }
    };

    let session = Session::new(
        config,
        rank,
        world_size,
        host,
        recorder,
        DatatypeTable::load(),
    );
    // world communicator claims interned id 0 ahead of any app call
    session.intern_comm(world as usize);

    if session.config.dump_signal {
        install_dump_handler(session.config.dump_signal_number);
    }

    // Header is on disk; only now run the exchange, so a hang inside it
    // still leaves evidence of the rank that entered init.
    match topology::collect(real, world_size) {
        Ok(topo) => {
            if let Some(recorder) = session.recorder() {
                if let Err(e) = recorder
                    .append_preamble(&crate::event::TraceRecord::Topology(topo.hosts))
                {
                    warn!("cannot record topology: {}", e);
                }
            }
        }
        Err(rc) => warn!("topology exchange failed ({}); trace stays header-only", rc),
    }

    info!("tracing rank {}/{} to {}", rank, world_size, path.display());
    if SESSION.set(session).is_err() {
        warn!("session already installed; duplicate init ignored");
    }
}

/// Seals the trace. Runs inside the finalize interception, before the
/// real finalize tears the library down.
pub fn finalize_handler() {
    if let Some(session) = SESSION.get() {
        if let Some(recorder) = session.recorder() {
            recorder.seal();
        }
    }
}

unsafe extern "C" fn dump_signal_handler(_sig: libc::c_int) {
    // lock-free path only; see Recorder::force_dump
    if let Some(session) = SESSION.get() {
        if let Some(recorder) = session.recorder() {
            recorder.force_dump();
        }
    }
}

fn install_dump_handler(signum: usize) {
    // SAFETY: sigaction with a handler that only touches lock-free state.
    unsafe {
        let handler: unsafe extern "C" fn(libc::c_int) = dump_signal_handler;
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signum as libc::c_int, &sa, std::ptr::null_mut()) != 0 {
            warn!(
                "cannot install dump handler for signal {}: {}",
                signum,
                std::io::Error::last_os_error()
            );
        }
    }
}
