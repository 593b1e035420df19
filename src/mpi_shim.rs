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

//! ABI surface of the underlying MPI library.
//!
//! The shim is loaded via `LD_PRELOAD`, so the real entry points are the
//! `PMPI_*` profiling symbols resolved at runtime with
//! `dlsym(RTLD_NEXT, ..)`; nothing here links against an MPI library at
//! build time. Handle representations follow the Open MPI ABI, where
//! communicators and datatypes are pointers to predefined objects
//! (`ompi_mpi_comm_world`, `ompi_mpi_int`, ..). Supporting an int-handle
//! ABI only requires a different symbol table in this module.

use crate::registry::DatatypeId;

use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::LazyLock;

pub type MpiComm = *mut libc::c_void;
pub type MpiDatatype = *mut libc::c_void;
pub type MpiOp = *mut libc::c_void;
pub type MpiStatus = libc::c_void;

pub type MpiResultCode = libc::c_int;

pub const MPI_SUCCESS: MpiResultCode = 0;
// Open MPI value; only produced when no MPI library is underneath us.
pub const MPI_ERR_INTERN: MpiResultCode = 17;

pub const MPI_ANY_SOURCE: libc::c_int = -1;

/// # Safety
///
/// the input must not have interior NUL bytes
macro_rules! static_cstr {
    ($l:expr) => {
        ::std::ffi::CStr::from_bytes_with_nul_unchecked(concat!($l, "\0").as_bytes())
    };
}

/// # Safety
///
/// The caller promises that the symbol, if present, has the function type
/// it is transmuted to.
unsafe fn resolve<F>(name: &CStr) -> Option<F> {
    let ptr = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    if ptr.is_null() {
        None
    } else {
        Some(std::mem::transmute_copy::<*mut libc::c_void, F>(&ptr))
    }
}

pub type InitFn = unsafe extern "C" fn(
    *mut libc::c_int,
    *mut *mut *mut libc::c_char,
) -> MpiResultCode;
pub type InitThreadFn = unsafe extern "C" fn(
    *mut libc::c_int,
    *mut *mut *mut libc::c_char,
    libc::c_int,
    *mut libc::c_int,
) -> MpiResultCode;
pub type FinalizeFn = unsafe extern "C" fn() -> MpiResultCode;
pub type CommRankFn = unsafe extern "C" fn(MpiComm, *mut libc::c_int) -> MpiResultCode;
pub type BarrierFn = unsafe extern "C" fn(MpiComm) -> MpiResultCode;
pub type BcastFn = unsafe extern "C" fn(
    *mut libc::c_void,
    libc::c_int,
    MpiDatatype,
    libc::c_int,
    MpiComm,
) -> MpiResultCode;
pub type ReduceFn = unsafe extern "C" fn(
    *const libc::c_void,
    *mut libc::c_void,
    libc::c_int,
    MpiDatatype,
    MpiOp,
    libc::c_int,
    MpiComm,
) -> MpiResultCode;
pub type AllreduceFn = unsafe extern "C" fn(
    *const libc::c_void,
    *mut libc::c_void,
    libc::c_int,
    MpiDatatype,
    MpiOp,
    MpiComm,
) -> MpiResultCode;
pub type GatherFn = unsafe extern "C" fn(
    *const libc::c_void,
    libc::c_int,
    MpiDatatype,
    *mut libc::c_void,
    libc::c_int,
    MpiDatatype,
    libc::c_int,
    MpiComm,
) -> MpiResultCode;
pub type AllgatherFn = unsafe extern "C" fn(
    *const libc::c_void,
    libc::c_int,
    MpiDatatype,
    *mut libc::c_void,
    libc::c_int,
    MpiDatatype,
    MpiComm,
) -> MpiResultCode;
pub type SendFn = unsafe extern "C" fn(
    *const libc::c_void,
    libc::c_int,
    MpiDatatype,
    libc::c_int,
    libc::c_int,
    MpiComm,
) -> MpiResultCode;
pub type RecvFn = unsafe extern "C" fn(
    *mut libc::c_void,
    libc::c_int,
    MpiDatatype,
    libc::c_int,
    libc::c_int,
    MpiComm,
    *mut MpiStatus,
) -> MpiResultCode;

/// The real `PMPI_*` entry points, resolved once per process.
#[derive(Debug, Clone, Copy)]
pub struct RealMpi {
    pub init: InitFn,
    pub init_thread: InitThreadFn,
    pub finalize: FinalizeFn,
    pub comm_rank: CommRankFn,
    pub comm_size: CommRankFn,
    pub barrier: BarrierFn,
    pub bcast: BcastFn,
    pub reduce: ReduceFn,
    pub allreduce: AllreduceFn,
    pub gather: GatherFn,
    pub allgather: AllgatherFn,
    pub scatter: GatherFn,
    pub send: SendFn,
    pub recv: RecvFn,
}

macro_rules! resolve_pmpi {
    ($sym: literal) => {
        // SAFETY: symbol name has no interior NUL bytes; the PMPI profiling
        // interface fixes the function type of each symbol.
        unsafe { resolve(static_cstr!($sym))? }
    };
}

impl RealMpi {
    fn load() -> Option<Self> {
        Some(Self {
            init: resolve_pmpi!("PMPI_Init"),
            init_thread: resolve_pmpi!("PMPI_Init_thread"),
            finalize: resolve_pmpi!("PMPI_Finalize"),
            comm_rank: resolve_pmpi!("PMPI_Comm_rank"),
            comm_size: resolve_pmpi!("PMPI_Comm_size"),
            barrier: resolve_pmpi!("PMPI_Barrier"),
            bcast: resolve_pmpi!("PMPI_Bcast"),
            reduce: resolve_pmpi!("PMPI_Reduce"),
            allreduce: resolve_pmpi!("PMPI_Allreduce"),
            gather: resolve_pmpi!("PMPI_Gather"),
            allgather: resolve_pmpi!("PMPI_Allgather"),
            scatter: resolve_pmpi!("PMPI_Scatter"),
            send: resolve_pmpi!("PMPI_Send"),
            recv: resolve_pmpi!("PMPI_Recv"),
        })
    }
}

static REAL_MPI: LazyLock<Option<RealMpi>> = LazyLock::new(RealMpi::load);

/// Returns the resolved library, or None when no MPI implementation is
/// loaded beneath the shim (a deployment error, not a program error).
pub fn real() -> Option<&'static RealMpi> {
    REAL_MPI.as_ref()
}

/// Address of a predefined MPI object, usable as its handle under the
/// pointer-handle ABI.
fn predefined_handle(name: &CStr) -> Option<*mut libc::c_void> {
    // SAFETY: dlsym on a NUL-terminated name; the address itself is the
    // handle, it is never dereferenced here.
    let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

pub fn comm_world() -> Option<MpiComm> {
    // SAFETY: string has no interior NUL bytes
    predefined_handle(unsafe { static_cstr!("ompi_mpi_comm_world") })
}

pub fn datatype_char() -> Option<MpiDatatype> {
    // SAFETY: string has no interior NUL bytes
    predefined_handle(unsafe { static_cstr!("ompi_mpi_char") })
}

const PREDEFINED_DATATYPES: &[(&CStr, DatatypeId)] = &[
    (c"ompi_mpi_char", DatatypeId::Char),
    (c"ompi_mpi_signed_char", DatatypeId::Char),
    (c"ompi_mpi_unsigned_char", DatatypeId::Byte),
    (c"ompi_mpi_byte", DatatypeId::Byte),
    (c"ompi_mpi_short", DatatypeId::Short),
    (c"ompi_mpi_unsigned_short", DatatypeId::Short),
    (c"ompi_mpi_int", DatatypeId::Int),
    (c"ompi_mpi_unsigned", DatatypeId::Int),
    (c"ompi_mpi_long", DatatypeId::Long),
    (c"ompi_mpi_unsigned_long", DatatypeId::Long),
    (c"ompi_mpi_long_long_int", DatatypeId::Long),
    (c"ompi_mpi_float", DatatypeId::Float),
    (c"ompi_mpi_double", DatatypeId::Double),
];

/// Maps raw datatype handles back to stable identifiers so traces from
/// different processes stay comparable (raw handles are process-local
/// addresses).
#[derive(Debug, Default)]
pub struct DatatypeTable {
    by_handle: HashMap<usize, DatatypeId>,
}

impl DatatypeTable {
    pub fn load() -> Self {
        let by_handle = PREDEFINED_DATATYPES
            .iter()
            .filter_map(|(sym, id)| predefined_handle(sym).map(|h| (h as usize, *id)))
            .collect();
        Self { by_handle }
    }

    pub fn identify(&self, handle: MpiDatatype) -> DatatypeId {
        self.by_handle
            .get(&(handle as usize))
            .copied()
            .unwrap_or(DatatypeId::Derived)
    }
}
