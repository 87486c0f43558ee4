use std::fmt::Debug;

use crate::generic::{
    AccelerationStructureDesc, AccelerationStructureLevel, AccelerationStructureSizes,
    BlasBuildDesc, BufferDesc, BufferRange, DeviceAddress, DeviceError, DeviceLimits, Generation,
    OutOfMemory, TlasBuildDesc,
};

pub trait Buffer: Debug + Send + Sync + 'static {
    /// Size of the buffer in bytes.
    fn size(&self) -> usize;

    /// Device address of the first byte of the buffer.
    fn address(&self) -> DeviceAddress;
}

pub trait AccelerationStructure: Debug + Send + Sync + 'static {
    fn level(&self) -> AccelerationStructureLevel;

    /// Size of the structure storage in bytes.
    fn size(&self) -> usize;

    /// Address used to reference this structure from instances.
    fn address(&self) -> DeviceAddress;
}

/// Device that can build acceleration structures.
///
/// Resources are not destroyed on drop.
/// Managers route every resource that may still be referenced by
/// in-flight commands through a deferred destruction queue
/// and call the `destroy_*` methods once it is safe.
pub trait Device: Clone + Debug + Send + Sync + 'static {
    type Buffer: Buffer;
    type AccelerationStructure: AccelerationStructure;
    type QueryPool: Debug + Send + Sync + 'static;

    /// Returns limits of the device.
    fn limits(&self) -> &DeviceLimits;

    /// Create a new buffer with uninitialized contents.
    fn new_buffer(&self, desc: BufferDesc) -> Result<Self::Buffer, OutOfMemory>;

    /// Writes data into host-visible buffer.
    ///
    /// The range must not be read by any in-flight command.
    fn write_buffer(
        &self,
        buffer: &mut Self::Buffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), OutOfMemory>;

    fn destroy_buffer(&self, buffer: Self::Buffer);

    /// Queries memory requirements for a bottom-level build.
    fn blas_build_sizes(&self, desc: BlasBuildDesc) -> AccelerationStructureSizes;

    /// Queries memory requirements for a top-level build.
    fn tlas_build_sizes(&self, desc: TlasBuildDesc) -> AccelerationStructureSizes;

    fn new_acceleration_structure(
        &self,
        desc: AccelerationStructureDesc,
    ) -> Result<Self::AccelerationStructure, OutOfMemory>;

    fn destroy_acceleration_structure(&self, accel: Self::AccelerationStructure);

    /// Create a pool of `count` compacted size queries.
    fn new_compacted_size_queries(&self, count: u32) -> Result<Self::QueryPool, OutOfMemory>;

    /// Reads compacted sizes without blocking.
    ///
    /// Returns `None` if results are not available yet.
    fn compacted_sizes(
        &self,
        pool: &Self::QueryPool,
        count: u32,
    ) -> Result<Option<Vec<usize>>, DeviceError>;

    fn destroy_query_pool(&self, pool: Self::QueryPool);
}

/// Command list being recorded.
pub trait CommandEncoder<D: Device> {
    /// Generation assigned to this command list.
    fn generation(&self) -> Generation;

    /// Orders acceleration structure builds and copies recorded before
    /// the barrier with all acceleration structure access after it.
    fn acceleration_structure_barrier(&mut self);

    /// Records bottom-level build.
    ///
    /// With `src` set the build updates `src` into `dst`.
    fn build_blas(
        &mut self,
        dst: &D::AccelerationStructure,
        src: Option<&D::AccelerationStructure>,
        desc: BlasBuildDesc,
        scratch: BufferRange<'_, D::Buffer>,
    );

    /// Records top-level build over `count` instance records.
    fn build_tlas(
        &mut self,
        dst: &D::AccelerationStructure,
        desc: TlasBuildDesc,
        instances: BufferRange<'_, D::Buffer>,
        count: u32,
        scratch: BufferRange<'_, D::Buffer>,
    );

    /// Records write of compacted sizes of `structures` into the query pool.
    fn write_compacted_sizes(&mut self, structures: &[&D::AccelerationStructure], pool: &D::QueryPool);

    /// Records compacting copy.
    fn copy_compacted(&mut self, src: &D::AccelerationStructure, dst: &D::AccelerationStructure);
}
