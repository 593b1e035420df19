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

//! Static registry of interceptable operations.
//!
//! Each operation maps to a signature shape describing which operand roles
//! matter for cross-rank consistency. Adding an operation is one table
//! entry plus one thin foreign wrapper in `lib.rs`; the recording path
//! never dispatches on the operation itself.

use std::collections::HashMap;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    Barrier,
    Bcast,
    Reduce,
    Allreduce,
    Gather,
    Allgather,
    Scatter,
    Send,
    Recv,
    Init,
    Finalize,
    Unknown,
}

static OPCODE_NAME_LOOKUP: LazyLock<HashMap<&'static str, Opcode>> = LazyLock::new(|| {
    [
        ("barrier", Opcode::Barrier),
        ("bcast", Opcode::Bcast),
        ("reduce", Opcode::Reduce),
        ("allreduce", Opcode::Allreduce),
        ("gather", Opcode::Gather),
        ("allgather", Opcode::Allgather),
        ("scatter", Opcode::Scatter),
        ("send", Opcode::Send),
        ("recv", Opcode::Recv),
        ("init", Opcode::Init),
        ("finalize", Opcode::Finalize),
    ]
    .iter()
    .cloned()
    .collect()
});

impl Opcode {
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Barrier => "barrier",
            Opcode::Bcast => "bcast",
            Opcode::Reduce => "reduce",
            Opcode::Allreduce => "allreduce",
            Opcode::Gather => "gather",
            Opcode::Allgather => "allgather",
            Opcode::Scatter => "scatter",
            Opcode::Send => "send",
            Opcode::Recv => "recv",
            Opcode::Init => "init",
            Opcode::Finalize => "finalize",
            Opcode::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Opcode {
        OPCODE_NAME_LOOKUP
            .get(name)
            .cloned()
            .unwrap_or(Opcode::Unknown)
    }

    pub fn is_collective(&self) -> bool {
        matches!(shape(*self).class, OpClass::Collective)
    }

    pub fn is_p2p(&self) -> bool {
        matches!(shape(*self).class, OpClass::PointToPoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Collective,
    PointToPoint,
    Lifecycle,
}

/// Direction of the peer operand for point-to-point operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    None,
    Destination,
    Source,
}

#[derive(Debug, Clone, Copy)]
pub struct SignatureShape {
    pub class: OpClass,
    pub has_count: bool,
    pub has_datatype: bool,
    /// root operand must agree across participants
    pub has_root: bool,
    pub peer: PeerRole,
}

const SHAPE_NONE: SignatureShape = SignatureShape {
    class: OpClass::Lifecycle,
    has_count: false,
    has_datatype: false,
    has_root: false,
    peer: PeerRole::None,
};

const SHAPE_COLL: SignatureShape = SignatureShape {
    class: OpClass::Collective,
    has_count: true,
    has_datatype: true,
    has_root: false,
    peer: PeerRole::None,
};

const SHAPE_COLL_ROOTED: SignatureShape = SignatureShape {
    has_root: true,
    ..SHAPE_COLL
};

static REGISTRY: LazyLock<HashMap<Opcode, SignatureShape>> = LazyLock::new(|| {
    [
        (
            Opcode::Barrier,
            SignatureShape {
                class: OpClass::Collective,
                ..SHAPE_NONE
            },
        ),
        (Opcode::Bcast, SHAPE_COLL_ROOTED),
        (Opcode::Reduce, SHAPE_COLL_ROOTED),
        (Opcode::Allreduce, SHAPE_COLL),
        (Opcode::Gather, SHAPE_COLL_ROOTED),
        (Opcode::Allgather, SHAPE_COLL),
        (Opcode::Scatter, SHAPE_COLL_ROOTED),
        (
            Opcode::Send,
            SignatureShape {
                class: OpClass::PointToPoint,
                peer: PeerRole::Destination,
                ..SHAPE_COLL
            },
        ),
        (
            Opcode::Recv,
            SignatureShape {
                class: OpClass::PointToPoint,
                peer: PeerRole::Source,
                ..SHAPE_COLL
            },
        ),
        (Opcode::Init, SHAPE_NONE),
        (Opcode::Finalize, SHAPE_NONE),
    ]
    .iter()
    .cloned()
    .collect()
});

pub fn shape(op: Opcode) -> &'static SignatureShape {
    REGISTRY.get(&op).unwrap_or(&SHAPE_NONE)
}

/// Stable datatype identity, comparable across processes (raw MPI handles
/// are not; see `mpi_shim::DatatypeTable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatatypeId {
    Char,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// user-defined datatype; recorded but not shape-compared
    Derived,
}

impl DatatypeId {
    pub fn name(&self) -> &'static str {
        match self {
            DatatypeId::Char => "char",
            DatatypeId::Byte => "byte",
            DatatypeId::Short => "short",
            DatatypeId::Int => "int",
            DatatypeId::Long => "long",
            DatatypeId::Float => "float",
            DatatypeId::Double => "double",
            DatatypeId::Derived => "derived",
        }
    }

    pub fn from_name(name: &str) -> DatatypeId {
        match name {
            "char" => DatatypeId::Char,
            "byte" => DatatypeId::Byte,
            "short" => DatatypeId::Short,
            "int" => DatatypeId::Int,
            "long" => DatatypeId::Long,
            "float" => DatatypeId::Float,
            "double" => DatatypeId::Double,
            _ => DatatypeId::Derived,
        }
    }

    pub fn num_bytes(&self) -> usize {
        match self {
            DatatypeId::Char | DatatypeId::Byte => 1,
            DatatypeId::Short => 2,
            DatatypeId::Int | DatatypeId::Float => 4,
            DatatypeId::Long | DatatypeId::Double => 8,
            DatatypeId::Derived => 1,
        }
    }
}
