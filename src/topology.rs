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

//! One-shot rank→host topology collection.
//!
//! Runs inside the init interception, after the communication layer is
//! ready and before any instrumented call of the traced program: every
//! process contributes its hostname through a single allgather of
//! fixed-width buffers and ends up with an identical mapping. The trace
//! header is written before the exchange, so a process that hangs here
//! leaves a header-only trace — which the analyzer reports as the
//! earliest possible divergence.

use crate::mpi_shim::{self, RealMpi, MPI_ERR_INTERN, MPI_SUCCESS};
use crate::CheckResult;

use static_assertions::const_assert;

/// Fixed per-rank slot width in the exchange buffer, NUL padded.
pub const HOST_NAME_WIDTH: usize = 256;
const_assert!(HOST_NAME_WIDTH.is_power_of_two());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub hosts: Vec<String>,
}

impl Topology {
    pub fn world_size(&self) -> usize {
        self.hosts.len()
    }

    pub fn host_of(&self, rank: i32) -> Option<&str> {
        usize::try_from(rank)
            .ok()
            .and_then(|r| self.hosts.get(r))
            .map(String::as_str)
    }
}

pub fn local_hostname() -> String {
    let mut buf = [0u8; HOST_NAME_WIDTH];
    // SAFETY: buffer is writable for its full length; gethostname
    // NUL-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len() - 1) };
    if rc != 0 {
        return String::from("unknown");
    }
    string_from_slot(&buf)
}

/// Gathers every rank's hostname over the world communicator. Must run
/// before any instrumented collective of the traced program.
pub fn collect(real: &RealMpi, world_size: i32) -> CheckResult<Topology> {
    let comm = mpi_shim::comm_world().ok_or(MPI_ERR_INTERN)?;
    let datatype = mpi_shim::datatype_char().ok_or(MPI_ERR_INTERN)?;

    let mut send = [0u8; HOST_NAME_WIDTH];
    let name = local_hostname();
    let n = name.len().min(HOST_NAME_WIDTH - 1);
    send[..n].copy_from_slice(&name.as_bytes()[..n]);

    let n_ranks = usize::try_from(world_size).map_err(|_| MPI_ERR_INTERN)?;
    let mut recv = vec![0u8; n_ranks * HOST_NAME_WIDTH];

    // SAFETY: both buffers are sized for world_size slots of
    // HOST_NAME_WIDTH chars; the call contract matches PMPI_Allgather.
    let rc = unsafe {
        (real.allgather)(
            send.as_ptr().cast(),
            HOST_NAME_WIDTH as libc::c_int,
            datatype,
            recv.as_mut_ptr().cast(),
            HOST_NAME_WIDTH as libc::c_int,
            datatype,
            comm,
        )
    };
    if rc != MPI_SUCCESS {
        return Err(rc);
    }

    Ok(Topology {
        hosts: hosts_from_buffer(&recv, n_ranks),
    })
}

fn string_from_slot(slot: &[u8]) -> String {
    let end = slot.iter().position(|b| *b == 0).unwrap_or(slot.len());
    String::from_utf8_lossy(&slot[..end]).into_owned()
}

fn hosts_from_buffer(buf: &[u8], n_ranks: usize) -> Vec<String> {
    (0..n_ranks)
        .map(|r| string_from_slot(&buf[r * HOST_NAME_WIDTH..(r + 1) * HOST_NAME_WIDTH]))
        .collect()
}
