use ash::vk;

use crate::generic::{
    AccelerationStructureBuildFlags, AccelerationStructureLevel, AccelerationStructurePerformance,
    BlasGeometryDesc, BufferUsage, BuildMode, DeviceAddress, IndexFormat, VertexFormat,
};

macro_rules! from_flags {
    ($from:ty => $to:ty, [$($from_flag:ident),* $(,)?], $flags:expr) => {
        from_flags!($from => $to, [$($from_flag => $from_flag,)*], $flags)
    };
    ($from:ty => $to:ty, [$($from_flag:ident => $to_flag:ident),* $(,)?], $flags:expr) => {{
        let mut dst = <$to>::empty();
        let src = $flags;
        $(
            if src.contains(<$from>::$from_flag) {
                dst |= <$to>::$to_flag;
            }
        )*
        dst
    }};
}

pub trait AshFrom<T> {
    fn ash_from(ash: T) -> Self;
}

pub trait IntoAsh<A> {
    fn into_ash(self) -> A;
}

impl<A, T> IntoAsh<A> for T
where
    A: AshFrom<T>,
{
    #[inline(always)]
    fn into_ash(self) -> A {
        A::ash_from(self)
    }
}

impl AshFrom<BufferUsage> for vk::BufferUsageFlags {
    #[inline(always)]
    fn ash_from(value: BufferUsage) -> Self {
        from_flags!(BufferUsage => vk::BufferUsageFlags, [
            TRANSFER_SRC => TRANSFER_SRC,
            TRANSFER_DST => TRANSFER_DST,
            STORAGE => STORAGE_BUFFER,
            INDEX => INDEX_BUFFER,
            VERTEX => VERTEX_BUFFER,
            BUILD_INPUT => ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            ACCELERATION_STRUCTURE => ACCELERATION_STRUCTURE_STORAGE_KHR,
            SCRATCH => STORAGE_BUFFER,
        ], value)
    }
}

impl AshFrom<(AccelerationStructureBuildFlags, AccelerationStructurePerformance)>
    for vk::BuildAccelerationStructureFlagsKHR
{
    #[inline(always)]
    fn ash_from(
        (flags, performance): (AccelerationStructureBuildFlags, AccelerationStructurePerformance),
    ) -> Self {
        let mut result = from_flags!(AccelerationStructureBuildFlags => vk::BuildAccelerationStructureFlagsKHR, [
            ALLOW_UPDATE => ALLOW_UPDATE,
            ALLOW_COMPACTION => ALLOW_COMPACTION,
            LOW_MEMORY => LOW_MEMORY,
        ], flags);

        match performance {
            AccelerationStructurePerformance::Default => {}
            AccelerationStructurePerformance::FastTrace => {
                result |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
            }
            AccelerationStructurePerformance::FastBuild => {
                result |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
            }
        }
        result
    }
}

impl AshFrom<AccelerationStructureLevel> for vk::AccelerationStructureTypeKHR {
    #[inline(always)]
    fn ash_from(value: AccelerationStructureLevel) -> Self {
        match value {
            AccelerationStructureLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            AccelerationStructureLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

impl AshFrom<BuildMode> for vk::BuildAccelerationStructureModeKHR {
    #[inline(always)]
    fn ash_from(value: BuildMode) -> Self {
        match value {
            BuildMode::Build => vk::BuildAccelerationStructureModeKHR::BUILD,
            BuildMode::Update => vk::BuildAccelerationStructureModeKHR::UPDATE,
        }
    }
}

impl AshFrom<VertexFormat> for vk::Format {
    fn ash_from(value: VertexFormat) -> Self {
        match value {
            VertexFormat::Float16x2 => vk::Format::R16G16_SFLOAT,
            VertexFormat::Float16x4 => vk::Format::R16G16B16A16_SFLOAT,
            VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
            VertexFormat::Snorm16x2 => vk::Format::R16G16_SNORM,
            VertexFormat::Snorm16x4 => vk::Format::R16G16B16A16_SNORM,
        }
    }
}

impl AshFrom<IndexFormat> for vk::IndexType {
    #[inline(always)]
    fn ash_from(value: IndexFormat) -> Self {
        match value {
            IndexFormat::Uint16 => vk::IndexType::UINT16,
            IndexFormat::Uint32 => vk::IndexType::UINT32,
        }
    }
}

#[inline(always)]
fn const_address(address: DeviceAddress) -> vk::DeviceOrHostAddressConstKHR {
    vk::DeviceOrHostAddressConstKHR {
        device_address: address,
    }
}

impl AshFrom<&BlasGeometryDesc> for vk::AccelerationStructureGeometryKHR {
    fn ash_from(value: &BlasGeometryDesc) -> Self {
        let mut builder = vk::AccelerationStructureGeometryKHR::builder();
        if value.is_opaque() {
            builder = builder.flags(vk::GeometryFlagsKHR::OPAQUE);
        }

        match value {
            BlasGeometryDesc::Triangles(triangles) => {
                let mut data = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                    .vertex_format(triangles.vertex_format.into_ash())
                    .vertex_data(const_address(triangles.vertices))
                    .vertex_stride(triangles.vertex_stride as u64)
                    .max_vertex(triangles.max_vertex)
                    .index_type(vk::IndexType::NONE_KHR);

                if let Some(indices) = triangles.indices {
                    data = data
                        .index_type(indices.format.into_ash())
                        .index_data(const_address(indices.address));
                }
                if let Some(transform) = triangles.transform {
                    data = data.transform_data(const_address(transform));
                }

                builder
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        triangles: data.build(),
                    })
                    .build()
            }
            BlasGeometryDesc::Aabbs(aabbs) => builder
                .geometry_type(vk::GeometryTypeKHR::AABBS)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::builder()
                        .data(const_address(aabbs.boxes))
                        .stride(aabbs.box_stride as u64)
                        .build(),
                })
                .build(),
        }
    }
}

/// Geometry of a top-level build reading tightly packed instance records.
pub fn instances_geometry(address: DeviceAddress) -> vk::AccelerationStructureGeometryKHR {
    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                .array_of_pointers(false)
                .data(const_address(address))
                .build(),
        })
        .build()
}

#[inline(always)]
pub fn build_range(primitive_count: u32) -> vk::AccelerationStructureBuildRangeInfoKHR {
    vk::AccelerationStructureBuildRangeInfoKHR {
        primitive_count,
        primitive_offset: 0,
        first_vertex: 0,
        transform_offset: 0,
    }
}
