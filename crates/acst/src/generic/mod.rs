mod acst;
mod buffer;
mod format;
mod instance;
mod limits;

use std::{error::Error, fmt};

pub use self::{
    acst::{
        AccelerationStructureBuildFlags, AccelerationStructureDesc, AccelerationStructureLevel,
        AccelerationStructurePerformance, AccelerationStructureSizes, BlasAabbs, BlasBuildDesc,
        BlasGeometryDesc, BlasIndices, BlasTriangles, BuildMode, GeometryAddresses,
        TlasBuildDesc,
    },
    buffer::{BufferDesc, BufferRange, BufferUsage, Memory},
    format::{IndexFormat, VertexFormat},
    instance::{InstanceFlags, InstanceRecord, Transform3x4},
    limits::DeviceLimits,
};

/// GPU-visible address of a buffer or an acceleration structure.
pub type DeviceAddress = u64;

/// Position of a command list on the submission timeline.
///
/// Generations grow monotonically. Completion of generation `G`
/// implies completion of every generation before it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Generation(u64);

impl Generation {
    pub const ZERO: Self = Generation(0);

    #[inline(always)]
    pub const fn new(value: u64) -> Self {
        Generation(value)
    }

    #[inline(always)]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn next(self) -> Self {
        Generation(self.0 + 1)
    }

    /// Returns generation that is `n` steps behind, saturating at zero.
    #[inline(always)]
    pub const fn saturating_sub(self, n: u64) -> Self {
        Generation(self.0.saturating_sub(n))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Error that can happen when device's memory is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "out of memory")
    }
}

impl Error for OutOfMemory {}

/// Error reported by the device asynchronously.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceError {
    OutOfMemory,
    DeviceLost,
}

impl From<OutOfMemory> for DeviceError {
    #[inline(never)]
    fn from(_: OutOfMemory) -> Self {
        DeviceError::OutOfMemory
    }
}

impl fmt::Debug for DeviceError {
    #[inline(never)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::OutOfMemory => write!(f, "DeviceError::OutOfMemory"),
            DeviceError::DeviceLost => write!(f, "DeviceError::DeviceLost"),
        }
    }
}

impl fmt::Display for DeviceError {
    #[inline(never)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::OutOfMemory => write!(f, "out of memory"),
            DeviceError::DeviceLost => write!(f, "device lost"),
        }
    }
}

impl Error for DeviceError {}

/// Rounds `value` up to a multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}
