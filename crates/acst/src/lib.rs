//! Lifecycle management of ray tracing acceleration structures.
//!
//! Bottom-level structures are created, built in batches, refitted,
//! compacted and destroyed through [`BlasManager`] and [`CompactionPipeline`].
//! [`TlasManager`] rebuilds the top-level structure from instances every frame.
//! [`SceneAccel`] ties them together with a shared scratch pool and a
//! deferred destruction queue keyed by command list generations.
//!
//! Device access goes through the [`Device`] and [`CommandEncoder`] traits.
//! [`headless`] implements them on the host with full validation,
//! the `vulkan` feature enables a backend on top of `ash`.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod generic;
mod traits;

pub mod headless;

#[cfg(feature = "vulkan")]
pub mod vulkan;

mod blas;
mod compaction;
mod config;
mod deferred;
mod error;
mod layout;
mod scene;
mod scratch;
mod tlas;

pub use self::{
    blas::{BlasBuildInfo, BlasDesc, BlasId, BlasManager, BlasState, BlasUpdate, GeometryUpdate},
    compaction::{
        CompactedBlas, CompactionPipeline, CompactionRequest, CompactionState, DetachedCompaction,
    },
    config::AccelConfig,
    deferred::{DeferredDestructionQueue, Retired},
    error::{BuildError, CompactionError, RefitError, SceneError, TlasError, UnknownBlas},
    generic::*,
    layout::{
        BufferAddresses, GeometryLayout, GeometryPlacement, GeometrySource, MeshPlacement,
        MeshSource,
    },
    scene::{CompactionTicket, SceneAccel, SceneInstance, SceneMesh},
    scratch::{scratch_layout, ScratchPool},
    tlas::{validate_instances, TlasBuildInfo, TlasManager, TlasState},
    traits::{AccelerationStructure, Buffer, CommandEncoder, Device},
};
