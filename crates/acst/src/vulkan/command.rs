use ash::vk;
use smallvec::SmallVec;

use crate::generic::{BlasBuildDesc, BufferRange, BuildMode, Generation, TlasBuildDesc};

use super::{
    acst::AccelerationStructure,
    buffer::Buffer,
    device::{Device, QueryPool},
    from::{build_range, instances_geometry, IntoAsh},
};

/// Records acceleration structure commands into a command buffer
/// owned by the application.
///
/// The generation must be the value the application signals
/// on its timeline once the command buffer completes.
#[derive(Debug)]
pub struct CommandEncoder {
    device: Device,
    handle: vk::CommandBuffer,
    generation: Generation,
}

impl CommandEncoder {
    /// Wraps command buffer in recording state.
    ///
    /// # Safety
    ///
    /// `handle` must be allocated from `device` and be in recording state
    /// for as long as the encoder is used.
    pub unsafe fn new(device: &Device, handle: vk::CommandBuffer, generation: Generation) -> Self {
        CommandEncoder {
            device: device.clone(),
            handle,
            generation,
        }
    }

    /// Returns wrapped command buffer.
    pub fn finish(self) -> vk::CommandBuffer {
        self.handle
    }
}

#[inline(always)]
fn scratch_address(scratch: &BufferRange<'_, Buffer>) -> vk::DeviceOrHostAddressKHR {
    vk::DeviceOrHostAddressKHR {
        device_address: scratch.address(),
    }
}

impl crate::traits::CommandEncoder<Device> for CommandEncoder {
    #[inline(always)]
    fn generation(&self) -> Generation {
        self.generation
    }

    fn acceleration_structure_barrier(&mut self) {
        let access = vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
            | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR;

        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(access)
            .dst_access_mask(access | vk::AccessFlags::SHADER_READ)
            .build();

        unsafe {
            self.device.ash().cmd_pipeline_barrier(
                self.handle,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    fn build_blas(
        &mut self,
        dst: &AccelerationStructure,
        src: Option<&AccelerationStructure>,
        desc: BlasBuildDesc,
        scratch: BufferRange<'_, Buffer>,
    ) {
        let geometries: SmallVec<[vk::AccelerationStructureGeometryKHR; 4]> =
            desc.geometry.iter().map(IntoAsh::into_ash).collect();
        let ranges: SmallVec<[vk::AccelerationStructureBuildRangeInfoKHR; 4]> = desc
            .geometry
            .iter()
            .map(|geometry| build_range(geometry.primitive_count()))
            .collect();

        let mode = match src {
            None => BuildMode::Build,
            Some(_) => BuildMode::Update,
        };

        let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags((desc.flags, desc.performance).into_ash())
            .mode(mode.into_ash())
            .src_acceleration_structure(
                src.map_or(vk::AccelerationStructureKHR::null(), |src| src.handle),
            )
            .dst_acceleration_structure(dst.handle)
            .geometries(&geometries)
            .scratch_data(scratch_address(&scratch))
            .build();

        unsafe {
            self.device.accel().cmd_build_acceleration_structures(
                self.handle,
                &[info],
                &[&ranges[..]],
            );
        }
    }

    fn build_tlas(
        &mut self,
        dst: &AccelerationStructure,
        desc: TlasBuildDesc,
        instances: BufferRange<'_, Buffer>,
        count: u32,
        scratch: BufferRange<'_, Buffer>,
    ) {
        let geometries = [instances_geometry(instances.address())];
        let ranges = [build_range(count)];

        let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags((desc.flags, desc.performance).into_ash())
            .mode(BuildMode::Build.into_ash())
            .dst_acceleration_structure(dst.handle)
            .geometries(&geometries)
            .scratch_data(scratch_address(&scratch))
            .build();

        unsafe {
            self.device.accel().cmd_build_acceleration_structures(
                self.handle,
                &[info],
                &[&ranges[..]],
            );
        }
    }

    fn write_compacted_sizes(&mut self, structures: &[&AccelerationStructure], pool: &QueryPool) {
        debug_assert!(structures.len() <= pool.count as usize);

        let handles: SmallVec<[vk::AccelerationStructureKHR; 8]> =
            structures.iter().map(|accel| accel.handle).collect();

        unsafe {
            self.device
                .ash()
                .cmd_reset_query_pool(self.handle, pool.handle, 0, handles.len() as u32);

            self.device
                .accel()
                .cmd_write_acceleration_structures_properties(
                    self.handle,
                    &handles,
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    pool.handle,
                    0,
                );
        }
    }

    fn copy_compacted(&mut self, src: &AccelerationStructure, dst: &AccelerationStructure) {
        unsafe {
            self.device.accel().cmd_copy_acceleration_structure(
                self.handle,
                &vk::CopyAccelerationStructureInfoKHR::builder()
                    .src(src.handle)
                    .dst(dst.handle)
                    .mode(vk::CopyAccelerationStructureModeKHR::COMPACT),
            );
        }
    }
}
