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

//! collcheck: call-consistency tracing for SPMD message-passing programs.
//!
//! Built as a cdylib and injected with `LD_PRELOAD`, the crate exports
//! the MPI entry points below; each wrapper records a pre-forward trace
//! event and then forwards to the real `PMPI_*` implementation resolved
//! at runtime, so instrumented programs need no source changes and see
//! identical behavior and result codes. `collcheck-analyze` consumes the
//! per-rank traces offline.

pub mod analyzer;
pub mod clock;
pub mod config;
pub mod event;
pub mod mpi_shim;
pub mod recorder;
pub mod registry;
pub mod report;
pub mod session;
pub mod topology;
pub mod trace;

use mpi_shim::{MpiComm, MpiDatatype, MpiOp, MpiStatus};
use registry::Opcode;
use session::RawArgs;

use std::str::FromStr as _;
use std::sync::atomic::{AtomicI32, Ordering};

pub type CheckResult<T> = Result<T, mpi_shim::MpiResultCode>;

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;
static LOGGER_RANK: AtomicI32 = AtomicI32::new(-1);

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let rank = LOGGER_RANK.load(Ordering::Relaxed);
            if rank >= 0 {
                eprintln!("[collcheck rank {}] {} {}", rank, record.level(), record.args());
            } else {
                eprintln!("[collcheck] {} {}", record.level(), record.args());
            }
        }
    }

    fn flush(&self) {}
}

/// Installs the stderr logger; later calls only race on who wins the
/// one-time registration and are otherwise no-ops.
pub fn install_logger(level: &str) {
    if log::set_logger(&LOGGER).is_ok() {
        let filter = log::LevelFilter::from_str(level).unwrap_or(log::LevelFilter::Info);
        log::set_max_level(filter);
    }
}

pub(crate) fn set_logger_rank(rank: i32) {
    LOGGER_RANK.store(rank, Ordering::Relaxed);
}

macro_rules! forward_real {
    ($field: ident $(, $arg: expr)*) => {
        match mpi_shim::real() {
            Some(real) => (real.$field)($($arg),*),
            None => mpi_shim::MPI_ERR_INTERN,
        }
    };
}

#[allow(non_snake_case, clippy::missing_safety_doc)]
#[no_mangle]
pub unsafe extern "C" fn MPI_Init(
    argc: *mut libc::c_int,
    argv: *mut *mut *mut libc::c_char,
) -> libc::c_int {
    let rc = forward_real!(init, argc, argv);
    if rc == mpi_shim::MPI_SUCCESS {
        if let Some(real) = mpi_shim::real() {
            session::init_handler(real);
        }
    }
    rc
}

#[allow(non_snake_case, clippy::missing_safety_doc)]
#[no_mangle]
pub unsafe extern "C" fn MPI_Init_thread(
    argc: *mut libc::c_int,
    argv: *mut *mut *mut libc::c_char,
    required: libc::c_int,
    provided: *mut libc::c_int,
) -> libc::c_int {
    let rc = forward_real!(init_thread, argc, argv, required, provided);
    if rc == mpi_shim::MPI_SUCCESS {
        if let Some(real) = mpi_shim::real() {
            session::init_handler(real);
        }
    }
    rc
}

#[allow(non_snake_case, clippy::missing_safety_doc)]
#[no_mangle]
pub unsafe extern "C" fn MPI_Finalize() -> libc::c_int {
    // seal before forwarding; the real finalize tears the library down
    session::finalize_handler();
    forward_real!(finalize)
}

#[allow(non_snake_case, clippy::missing_safety_doc)]
#[no_mangle]
pub unsafe extern "C" fn MPI_Barrier(comm: MpiComm) -> libc::c_int {
    session::record_call(
        Opcode::Barrier,
        RawArgs {
            comm: Some(comm),
            ..RawArgs::default()
        },
    );
    forward_real!(barrier, comm)
}

#[allow(non_snake_case, clippy::missing_safety_doc)]
#[no_mangle]
pub unsafe extern "C" fn MPI_Bcast(
    buffer: *mut libc::c_void,
    count: libc::c_int,
    datatype: MpiDatatype,
    root: libc::c_int,
    comm: MpiComm,
) -> libc::c_int {
    session::record_call(
        Opcode::Bcast,
        RawArgs {
            count: Some(count as i64),
            datatype: Some(datatype),
            peer_or_root: Some(root),
            comm: Some(comm),
            ..RawArgs::default()
        },
    );
    forward_real!(bcast, buffer, count, datatype, root, comm)
}

#[allow(non_snake_case, clippy::missing_safety_doc)]
#[no_mangle]
pub unsafe extern "C" fn MPI_Reduce(
    sendbuf: *const libc::c_void,
    recvbuf: *mut libc::c_void,
    count: libc::c_int,
    datatype: MpiDatatype,
    op: MpiOp,
    root: libc::c_int,
    comm: MpiComm,
) -> libc::c_int {
    session::record_call(
        Opcode::Reduce,
        RawArgs {
            count: Some(count as i64),
            datatype: Some(datatype),
            peer_or_root: Some(root),
            comm: Some(comm),
            ..RawArgs::default()
        },
    );
    forward_real!(reduce, sendbuf, recvbuf, count, datatype, op, root, comm)
}

#[allow(non_snake_case, clippy::missing_safety_doc)]
#[no_mangle]
pub unsafe extern "C" fn MPI_Allreduce(
    sendbuf: *const libc::c_void,
    recvbuf: *mut libc::c_void,
    count: libc::c_int,
    datatype: MpiDatatype,
    op: MpiOp,
    comm: MpiComm,
) -> libc::c_int {
    session::record_call(
        Opcode::Allreduce,
        RawArgs {
            count: Some(count as i64),
            datatype: Some(datatype),
            comm: Some(comm),
            ..RawArgs::default()
        },
    );
    forward_real!(allreduce, sendbuf, recvbuf, count, datatype, op, comm)
}

#[allow(non_snake_case, clippy::missing_safety_doc)]
#[no_mangle]
pub unsafe extern "C" fn MPI_Gather(
    sendbuf: *const libc::c_void,
    sendcount: libc::c_int,
    sendtype: MpiDatatype,
    recvbuf: *mut libc::c_void,
    recvcount: libc::c_int,
    recvtype: MpiDatatype,
    root: libc::c_int,
    comm: MpiComm,
) -> libc::c_int {
    // send side is the one every rank must agree on
    session::record_call(
        Opcode::Gather,
        RawArgs {
            count: Some(sendcount as i64),
            datatype: Some(sendtype),
            peer_or_root: Some(root),
            comm: Some(comm),
            ..RawArgs::default()
        },
    );
    forward_real!(
        gather, sendbuf, sendcount, sendtype, recvbuf, recvcount, recvtype, root, comm
    )
}

#[allow(non_snake_case, clippy::missing_safety_doc)]
#[no_mangle]
pub unsafe extern "C" fn MPI_Allgather(
    sendbuf: *const libc::c_void,
    sendcount: libc::c_int,
    sendtype: MpiDatatype,
    recvbuf: *mut libc::c_void,
    recvcount: libc::c_int,
    recvtype: MpiDatatype,
    comm: MpiComm,
) -> libc::c_int {
    session::record_call(
        Opcode::Allgather,
        RawArgs {
            count: Some(sendcount as i64),
            datatype: Some(sendtype),
            comm: Some(comm),
            ..RawArgs::default()
        },
    );
    forward_real!(
        allgather, sendbuf, sendcount, sendtype, recvbuf, recvcount, recvtype, comm
    )
}

#[allow(non_snake_case, clippy::missing_safety_doc)]
#[no_mangle]
pub unsafe extern "C" fn MPI_Scatter(
    sendbuf: *const libc::c_void,
    sendcount: libc::c_int,
    sendtype: MpiDatatype,
    recvbuf: *mut libc::c_void,
    recvcount: libc::c_int,
    recvtype: MpiDatatype,
    root: libc::c_int,
    comm: MpiComm,
) -> libc::c_int {
    // receive side: the send operands are only meaningful at the root
    session::record_call(
        Opcode::Scatter,
        RawArgs {
            count: Some(recvcount as i64),
            datatype: Some(recvtype),
            peer_or_root: Some(root),
            comm: Some(comm),
            ..RawArgs::default()
        },
    );
    forward_real!(
        scatter, sendbuf, sendcount, sendtype, recvbuf, recvcount, recvtype, root, comm
    )
}

#[allow(non_snake_case, clippy::missing_safety_doc)]
#[no_mangle]
pub unsafe extern "C" fn MPI_Send(
    buf: *const libc::c_void,
    count: libc::c_int,
    datatype: MpiDatatype,
    dest: libc::c_int,
    tag: libc::c_int,
    comm: MpiComm,
) -> libc::c_int {
    session::record_call(
        Opcode::Send,
        RawArgs {
            count: Some(count as i64),
            datatype: Some(datatype),
            peer_or_root: Some(dest),
            tag: Some(tag),
            comm: Some(comm),
        },
    );
    forward_real!(send, buf, count, datatype, dest, tag, comm)
}

#[allow(non_snake_case, clippy::missing_safety_doc)]
#[no_mangle]
pub unsafe extern "C" fn MPI_Recv(
    buf: *mut libc::c_void,
    count: libc::c_int,
    datatype: MpiDatatype,
    source: libc::c_int,
    tag: libc::c_int,
    comm: MpiComm,
    status: *mut MpiStatus,
) -> libc::c_int {
    session::record_call(
        Opcode::Recv,
        RawArgs {
            count: Some(count as i64),
            datatype: Some(datatype),
            peer_or_root: Some(source),
            tag: Some(tag),
            comm: Some(comm),
        },
    );
    forward_real!(recv, buf, count, datatype, source, tag, comm, status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use event::{ArgSignature, CallEvent, TraceHeader, TraceRecord};
    use registry::DatatypeId;
    use report::Report;

    fn trace_lines(rank: i32, world_size: i32, counts: &[i64]) -> String {
        let mut lines = vec![
            TraceRecord::Header(TraceHeader {
                rank,
                world_size,
                host: format!("node-{}", rank),
            })
            .to_json()
            .to_string(),
            TraceRecord::Topology((0..world_size).map(|r| format!("node-{}", r)).collect())
                .to_json()
                .to_string(),
        ];
        for (i, count) in counts.iter().enumerate() {
            lines.push(
                TraceRecord::Event(CallEvent {
                    seq: i as u64,
                    op: Opcode::Bcast,
                    comm: 0,
                    sig: ArgSignature {
                        count: Some(*count),
                        datatype: Some(DatatypeId::Int),
                        peer_or_root: Some(0),
                        tag: None,
                    },
                    ts_ns: i as u64 * 10,
                    checked: true,
                })
                .to_json()
                .to_string(),
            );
        }
        lines.push(
            TraceRecord::Seal {
                n_events: counts.len() as u64,
            }
            .to_json()
            .to_string(),
        );
        lines.join("\n") + "\n"
    }

    // one corrupt trace among N: the divergence visible in the other
    // ranks is still found, and the run is flagged as reduced coverage
    #[test]
    fn corrupt_trace_does_not_mask_divergence_elsewhere() {
        let dir = std::env::temp_dir().join(format!("collcheck-e2e-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        std::fs::write(
            dir.join(config::trace_file_name(0)),
            trace_lines(0, 3, &[10]),
        )
        .unwrap();
        std::fs::write(
            dir.join(config::trace_file_name(1)),
            trace_lines(1, 3, &[20]),
        )
        .unwrap();
        std::fs::write(dir.join(config::trace_file_name(2)), "garbage\ngarbage\n").unwrap();

        let (traces, errors) = trace::load_dir(&dir).unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(errors.len(), 1);

        let analysis = analyzer::analyze(&traces);
        assert_eq!(analysis.divergences.len(), 1);
        assert_eq!(
            analysis.divergences[0].kind,
            analyzer::DivergenceKind::ArgumentMismatch
        );

        let report = Report::new(&analysis, &errors);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.to_json()["reduced_coverage"], true);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
