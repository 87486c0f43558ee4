use std::{fmt, sync::Arc};

use ash::{extensions::khr, vk};
use gpu_alloc::{Config, GpuAllocator};
use gpu_alloc_ash::AshMemoryDevice;
use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;

use crate::generic::{
    AccelerationStructureDesc, AccelerationStructureSizes, BlasBuildDesc, BufferDesc, BufferUsage,
    BuildMode, DeviceError, DeviceLimits, Memory, OutOfMemory, TlasBuildDesc,
};

use super::{
    acst::AccelerationStructure,
    buffer::Buffer,
    from::{instances_geometry, IntoAsh},
    handle_host_oom, memory_to_usage_flags, unexpected_error,
};

/// Offset of acceleration structure storage must be aligned to 256 bytes.
const ACCELERATION_STRUCTURE_ALIGNMENT: usize = 256;

struct DeviceInner {
    device: ash::Device,
    accel: khr::AccelerationStructure,
    limits: DeviceLimits,
    buffers: Mutex<Slab<vk::Buffer>>,
    structures: Mutex<Slab<vk::AccelerationStructureKHR>>,
    allocator: Mutex<GpuAllocator<vk::DeviceMemory>>,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let buffers = self.buffers.get_mut().len();
        let structures = self.structures.get_mut().len();
        if buffers != 0 || structures != 0 {
            tracing::warn!(
                "Device dropped with {buffers} buffers and {structures} acceleration structures alive"
            );
        }

        unsafe {
            self.allocator
                .get_mut()
                .cleanup(AshMemoryDevice::wrap(&self.device));
        }
    }
}

#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({:p})", self.inner.device.handle())
    }
}

/// Pool of compacted size queries.
#[derive(Debug)]
pub struct QueryPool {
    pub(super) handle: vk::QueryPool,
    pub(super) count: u32,
}

impl Device {
    /// Wraps logical device.
    ///
    /// # Safety
    ///
    /// `device` must be created from `physical_device` of `instance`
    /// with `VK_KHR_acceleration_structure` extension and
    /// `accelerationStructure` and `bufferDeviceAddress` features enabled.
    /// The device must outlive returned value and all resources created from it.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        let mut accel_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let properties = {
            let mut properties2 =
                vk::PhysicalDeviceProperties2::builder().push_next(&mut accel_properties);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
            properties2.properties
        };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let limits = DeviceLimits {
            min_scratch_offset_alignment: accel_properties
                .min_acceleration_structure_scratch_offset_alignment
                as usize,
            acceleration_structure_alignment: ACCELERATION_STRUCTURE_ALIGNMENT,
            // Saturate is OK.
            max_geometry_count: accel_properties
                .max_geometry_count
                .try_into()
                .unwrap_or(u32::MAX),
            max_instance_count: accel_properties
                .max_instance_count
                .try_into()
                .unwrap_or(u32::MAX),
            max_primitive_count: accel_properties
                .max_primitive_count
                .try_into()
                .unwrap_or(u32::MAX),
        };

        let allocator = GpuAllocator::new(
            Config::i_am_prototyping(),
            gpu_alloc::DeviceProperties {
                max_memory_allocation_count: properties.limits.max_memory_allocation_count,
                max_memory_allocation_size: u64::MAX,
                non_coherent_atom_size: properties.limits.non_coherent_atom_size,
                memory_types: memory_properties.memory_types
                    [..memory_properties.memory_type_count as usize]
                    .iter()
                    .map(|memory_type| gpu_alloc::MemoryType {
                        props: gpu_alloc_ash::memory_properties_from_ash(
                            memory_type.property_flags,
                        ),
                        heap: memory_type.heap_index,
                    })
                    .collect(),
                memory_heaps: memory_properties.memory_heaps
                    [..memory_properties.memory_heap_count as usize]
                    .iter()
                    .map(|&memory_heap| gpu_alloc::MemoryHeap {
                        size: memory_heap.size,
                    })
                    .collect(),
                buffer_device_address: true,
            },
        );

        let accel = khr::AccelerationStructure::new(instance, &device);

        tracing::debug!("Acceleration structure device limits: {limits:?}");

        Device {
            inner: Arc::new(DeviceInner {
                device,
                accel,
                limits,
                buffers: Mutex::new(Slab::new()),
                structures: Mutex::new(Slab::new()),
                allocator: Mutex::new(allocator),
            }),
        }
    }

    #[inline(always)]
    pub fn ash(&self) -> &ash::Device {
        &self.inner.device
    }

    #[inline(always)]
    pub(super) fn accel(&self) -> &khr::AccelerationStructure {
        &self.inner.accel
    }

    fn build_sizes(
        &self,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        max_primitive_counts: &[u32],
    ) -> AccelerationStructureSizes {
        let sizes = unsafe {
            self.inner.accel.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                info,
                max_primitive_counts,
            )
        };

        AccelerationStructureSizes {
            size: sizes.acceleration_structure_size as usize,
            scratch_size: sizes.build_scratch_size as usize,
            update_scratch_size: sizes.update_scratch_size as usize,
        }
    }
}

impl crate::traits::Device for Device {
    type Buffer = Buffer;
    type AccelerationStructure = AccelerationStructure;
    type QueryPool = QueryPool;

    #[inline(always)]
    fn limits(&self) -> &DeviceLimits {
        &self.inner.limits
    }

    fn new_buffer(&self, desc: BufferDesc) -> Result<Buffer, OutOfMemory> {
        let size = u64::try_from(desc.size.max(1)).map_err(|_| OutOfMemory)?;
        let align = u64::try_from(desc.align.max(1)).map_err(|_| OutOfMemory)?;
        let device = &self.inner.device;

        let usage: vk::BufferUsageFlags = desc.usage.into_ash();
        let buffer = unsafe {
            device.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(size)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .usage(usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
                None,
            )
        }
        .map_err(|err| match err {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => handle_host_oom(),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => OutOfMemory,
            err => unexpected_error(err),
        })?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let align_mask = requirements.alignment.max(align) - 1;

        let block = unsafe {
            self.inner.allocator.lock().alloc(
                AshMemoryDevice::wrap(device),
                gpu_alloc::Request {
                    size: requirements.size,
                    align_mask,
                    usage: memory_to_usage_flags(desc.memory),
                    memory_types: requirements.memory_type_bits,
                },
            )
        };

        let block = match block {
            Ok(block) => block,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(match err {
                    gpu_alloc::AllocationError::OutOfDeviceMemory => OutOfMemory,
                    gpu_alloc::AllocationError::OutOfHostMemory => handle_host_oom(),
                    gpu_alloc::AllocationError::NoCompatibleMemoryTypes => OutOfMemory,
                    gpu_alloc::AllocationError::TooManyObjects => OutOfMemory,
                });
            }
        };

        if let Err(err) = unsafe { device.bind_buffer_memory(buffer, *block.memory(), block.offset()) }
        {
            unsafe {
                device.destroy_buffer(buffer, None);
                self.inner
                    .allocator
                    .lock()
                    .dealloc(AshMemoryDevice::wrap(device), block);
            }
            return Err(match err {
                vk::Result::ERROR_OUT_OF_HOST_MEMORY => handle_host_oom(),
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => OutOfMemory,
                err => unexpected_error(err),
            });
        }

        let address = unsafe {
            device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::builder().buffer(buffer))
        };

        tracing::trace!("Buffer '{}' created at {address:#x}", desc.name);

        let idx = self.inner.buffers.lock().insert(buffer);
        Ok(Buffer::new(buffer, block, address, desc.size, idx))
    }

    fn write_buffer(
        &self,
        buffer: &mut Buffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), OutOfMemory> {
        debug_assert!(offset + data.len() <= crate::traits::Buffer::size(buffer));

        unsafe {
            buffer.block.write_bytes(
                AshMemoryDevice::wrap(&self.inner.device),
                offset as u64,
                data,
            )
        }
        .map_err(|err| match err {
            gpu_alloc::MapError::OutOfDeviceMemory => OutOfMemory,
            gpu_alloc::MapError::OutOfHostMemory => handle_host_oom(),
            err => {
                tracing::error!("Failed to map buffer memory: {err}");
                OutOfMemory
            }
        })
    }

    fn destroy_buffer(&self, buffer: Buffer) {
        let Buffer {
            handle, block, idx, ..
        } = buffer;

        self.inner.buffers.lock().remove(idx);

        unsafe {
            self.inner.device.destroy_buffer(handle, None);
            self.inner
                .allocator
                .lock()
                .dealloc(AshMemoryDevice::wrap(&self.inner.device), block);
        }
    }

    fn blas_build_sizes(&self, desc: BlasBuildDesc) -> AccelerationStructureSizes {
        let geometries: SmallVec<[vk::AccelerationStructureGeometryKHR; 4]> =
            desc.geometry.iter().map(IntoAsh::into_ash).collect();
        let counts: SmallVec<[u32; 4]> = desc
            .geometry
            .iter()
            .map(|geometry| geometry.primitive_count())
            .collect();

        let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags((desc.flags, desc.performance).into_ash())
            .mode(BuildMode::Build.into_ash())
            .geometries(&geometries);

        self.build_sizes(&info, &counts)
    }

    fn tlas_build_sizes(&self, desc: TlasBuildDesc) -> AccelerationStructureSizes {
        let geometries = [instances_geometry(0)];

        let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags((desc.flags, desc.performance).into_ash())
            .mode(BuildMode::Build.into_ash())
            .geometries(&geometries);

        self.build_sizes(&info, &[desc.max_instances])
    }

    fn new_acceleration_structure(
        &self,
        desc: AccelerationStructureDesc,
    ) -> Result<AccelerationStructure, OutOfMemory> {
        let buffer = self.new_buffer(BufferDesc {
            size: desc.size,
            align: self.inner.limits.acceleration_structure_alignment,
            usage: BufferUsage::ACCELERATION_STRUCTURE,
            memory: Memory::Device,
            name: desc.name,
        })?;

        let result = unsafe {
            self.inner.accel.create_acceleration_structure(
                &vk::AccelerationStructureCreateInfoKHR::builder()
                    .buffer(buffer.handle())
                    .offset(0)
                    .size(desc.size as u64)
                    .ty(desc.level.into_ash()),
                None,
            )
        };

        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                self.destroy_buffer(buffer);
                return Err(match err {
                    vk::Result::ERROR_OUT_OF_HOST_MEMORY => handle_host_oom(),
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => OutOfMemory,
                    err => unexpected_error(err),
                });
            }
        };

        let address = unsafe {
            self.inner.accel.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                    .acceleration_structure(handle),
            )
        };

        tracing::trace!(
            "Acceleration structure '{}' created at {address:#x}",
            desc.name
        );

        let idx = self.inner.structures.lock().insert(handle);
        Ok(AccelerationStructure::new(
            handle, buffer, desc.level, address, desc.size, idx,
        ))
    }

    fn destroy_acceleration_structure(&self, accel: AccelerationStructure) {
        self.inner.structures.lock().remove(accel.idx);

        unsafe {
            self.inner
                .accel
                .destroy_acceleration_structure(accel.handle, None);
        }
        self.destroy_buffer(accel.buffer);
    }

    fn new_compacted_size_queries(&self, count: u32) -> Result<QueryPool, OutOfMemory> {
        let handle = unsafe {
            self.inner.device.create_query_pool(
                &vk::QueryPoolCreateInfo::builder()
                    .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
                    .query_count(count),
                None,
            )
        }
        .map_err(|err| match err {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => handle_host_oom(),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => OutOfMemory,
            err => unexpected_error(err),
        })?;

        Ok(QueryPool { handle, count })
    }

    fn compacted_sizes(
        &self,
        pool: &QueryPool,
        count: u32,
    ) -> Result<Option<Vec<usize>>, DeviceError> {
        debug_assert!(count <= pool.count);

        let mut sizes = vec![0u64; count as usize];
        let result = unsafe {
            self.inner.device.get_query_pool_results(
                pool.handle,
                0,
                count,
                &mut sizes,
                vk::QueryResultFlags::TYPE_64,
            )
        };

        match result {
            Ok(()) => Ok(Some(sizes.into_iter().map(|size| size as usize).collect())),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(DeviceError::DeviceLost),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(DeviceError::OutOfMemory),
            Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => handle_host_oom(),
            Err(err) => unexpected_error(err),
        }
    }

    fn destroy_query_pool(&self, pool: QueryPool) {
        unsafe { self.inner.device.destroy_query_pool(pool.handle, None) }
    }
}
