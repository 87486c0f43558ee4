use crate::{
    blas::BlasId,
    compaction::CompactionState,
    generic::{DeviceAddress, DeviceError, OutOfMemory},
    scene::CompactionTicket,
};

/// Bottom-level structure handle does not refer to a live structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("bottom-level structure {0:?} does not exist")]
pub struct UnknownBlas(pub BlasId);

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),

    #[error(transparent)]
    UnknownBlas(#[from] UnknownBlas),

    #[error("bottom-level structure {0:?} appears twice in one build batch")]
    DuplicateBlas(BlasId),

    #[error("{count} geometries exceed device limit of {limit}")]
    TooManyGeometries { count: usize, limit: u32 },

    #[error("{count} primitives exceed device limit of {limit}")]
    TooManyPrimitives { count: u64, limit: u32 },

    #[error("scratch range of {provided} bytes is smaller than required {required} bytes")]
    InsufficientScratch { required: usize, provided: usize },

    #[error("scratch address {address:#x} is not aligned to {alignment} bytes")]
    MisalignedScratch {
        address: DeviceAddress,
        alignment: usize,
    },

    #[error("update of {0:?} recorded before its initial build")]
    UpdateBeforeBuild(BlasId),

    #[error("build of {id:?} needs {required} bytes of storage but structure has {available}")]
    StorageTooSmall {
        id: BlasId,
        required: usize,
        available: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RefitError {
    #[error(transparent)]
    UnknownBlas(#[from] UnknownBlas),

    #[error("bottom-level structure {0:?} was never built")]
    NotBuilt(BlasId),

    #[error("bottom-level structure {0:?} was built without update support")]
    UpdateNotAllowed(BlasId),

    #[error("refit provides {found} geometries, structure was built with {expected}")]
    GeometryCountMismatch { expected: usize, found: usize },

    #[error("refit of geometry {index} provides {found} primitives, structure was built with {expected}")]
    PrimitiveCountMismatch {
        index: usize,
        expected: u32,
        found: u32,
    },

    #[error("refit of geometry {index} changes geometry kind or buffer slots")]
    TopologyMismatch { index: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    UnknownBlas(#[from] UnknownBlas),

    #[error("compaction requested without candidates")]
    NoCandidates,

    #[error("bottom-level structure {0:?} was built without compaction support")]
    CompactionNotAllowed(BlasId),

    #[error("bottom-level structure {0:?} was never built")]
    NotBuilt(BlasId),

    #[error("bottom-level structure {0:?} is already pending compaction")]
    AlreadyPending(BlasId),

    #[error("bottom-level structure {0:?} appears twice in one compaction request")]
    DuplicateCandidate(BlasId),

    #[error("compaction request was already polled this frame")]
    PolledTwice,

    #[error("query returned {found} sizes for {expected} candidates")]
    SizeCountMismatch { expected: usize, found: usize },

    #[error("compaction request is {found:?}, operation requires {expected}")]
    InvalidState {
        expected: &'static str,
        found: CompactionState,
    },

    #[error("compacted structures do not match request candidates")]
    ForeignCompaction,
}

#[derive(Debug, thiserror::Error)]
pub enum TlasError {
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),

    #[error("{count} instances exceed capacity of {capacity}")]
    TooManyInstances { count: usize, capacity: u32 },

    #[error("instance {index} references {address:#x} which is not a live bottom-level structure")]
    StaleInstance {
        index: usize,
        address: DeviceAddress,
    },

    #[error("instance {index} references bottom-level structure {id:?} that was never built")]
    UnbuiltInstance { index: usize, id: BlasId },

    #[error("scratch range of {provided} bytes is smaller than required {required} bytes")]
    InsufficientScratch { required: usize, provided: usize },

    #[error("instance buffer range holds {capacity} records, build reads {count}")]
    InstanceBufferTooSmall { count: u32, capacity: usize },

    #[error("top-level build recorded without a rebuild in progress")]
    NotRebuilding,
}

/// Error returned by scene-level operations.
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Refit(#[from] RefitError),

    #[error(transparent)]
    Compaction(#[from] CompactionError),

    #[error(transparent)]
    Tlas(#[from] TlasError),

    #[error(transparent)]
    UnknownBlas(#[from] UnknownBlas),

    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),

    #[error("compaction ticket {0:?} does not exist")]
    UnknownTicket(CompactionTicket),
}
