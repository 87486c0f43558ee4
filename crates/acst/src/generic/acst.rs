use serde::{Deserialize, Serialize};

use super::{DeviceAddress, IndexFormat, VertexFormat};

/// Memory requirements reported by the pre-build size query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AccelerationStructureSizes {
    pub size: usize,
    pub scratch_size: usize,
    pub update_scratch_size: usize,
}

impl AccelerationStructureSizes {
    /// Scratch memory required to record a build in the given mode.
    #[inline(always)]
    pub fn scratch_for(&self, mode: BuildMode) -> usize {
        match mode {
            BuildMode::Build => self.scratch_size,
            BuildMode::Update => self.update_scratch_size,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccelerationStructurePerformance {
    Default,
    #[default]
    FastTrace,
    FastBuild,
}

bitflags::bitflags! {
    /// These flags are used to specify the build properties of an acceleration structure.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AccelerationStructureBuildFlags: u32 {
        /// Specifies that built acceleration structure could be used as a source
        /// for build with update operation.
        const ALLOW_UPDATE = 0x1;

        /// Specifies that built acceleration structure could be used as a source
        /// for copy operation with `Compact` mode.
        const ALLOW_COMPACTION = 0x2;

        /// Trade build and trace performance for smaller footprint.
        const LOW_MEMORY = 0x4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelerationStructureLevel {
    Bottom,
    Top,
}

/// Whether a build constructs the structure from scratch
/// or refits an existing one in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildMode {
    Build,
    Update,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlasIndices {
    pub format: IndexFormat,
    pub address: DeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlasTriangles {
    pub opaque: bool,
    pub vertex_format: VertexFormat,
    pub vertex_stride: usize,

    /// Highest vertex index referenced by the geometry.
    pub max_vertex: u32,
    pub vertices: DeviceAddress,
    pub indices: Option<BlasIndices>,

    /// Address of a row-major 3x4 transform applied to vertices.
    pub transform: Option<DeviceAddress>,
    pub primitive_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlasAabbs {
    pub opaque: bool,
    pub boxes: DeviceAddress,
    pub box_stride: usize,
    pub primitive_count: u32,
}

/// Description of one geometry of a bottom-level structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlasGeometryDesc {
    Triangles(BlasTriangles),
    Aabbs(BlasAabbs),
}

/// Device addresses of the buffers a geometry reads during a build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GeometryAddresses {
    /// Vertex positions or boxes.
    pub data: DeviceAddress,
    pub indices: Option<DeviceAddress>,
    pub transform: Option<DeviceAddress>,
}

impl BlasGeometryDesc {
    pub fn primitive_count(&self) -> u32 {
        match self {
            BlasGeometryDesc::Triangles(triangles) => triangles.primitive_count,
            BlasGeometryDesc::Aabbs(aabbs) => aabbs.primitive_count,
        }
    }

    pub fn is_opaque(&self) -> bool {
        match self {
            BlasGeometryDesc::Triangles(triangles) => triangles.opaque,
            BlasGeometryDesc::Aabbs(aabbs) => aabbs.opaque,
        }
    }

    /// Returns true if both descriptors have the same geometry kind
    /// and the same set of buffer slots.
    pub fn same_topology(&self, other: &Self) -> bool {
        match (self, other) {
            (BlasGeometryDesc::Triangles(a), BlasGeometryDesc::Triangles(b)) => {
                a.vertex_format == b.vertex_format
                    && a.indices.map(|i| i.format) == b.indices.map(|i| i.format)
                    && a.transform.is_some() == b.transform.is_some()
            }
            (BlasGeometryDesc::Aabbs(_), BlasGeometryDesc::Aabbs(_)) => true,
            _ => false,
        }
    }

    pub fn addresses(&self) -> GeometryAddresses {
        match self {
            BlasGeometryDesc::Triangles(triangles) => GeometryAddresses {
                data: triangles.vertices,
                indices: triangles.indices.map(|i| i.address),
                transform: triangles.transform,
            },
            BlasGeometryDesc::Aabbs(aabbs) => GeometryAddresses {
                data: aabbs.boxes,
                indices: None,
                transform: None,
            },
        }
    }

    /// Returns copy of this descriptor reading from new addresses.
    ///
    /// Slots absent from the descriptor are left absent.
    pub fn with_addresses(&self, addresses: GeometryAddresses) -> Self {
        match *self {
            BlasGeometryDesc::Triangles(mut triangles) => {
                triangles.vertices = addresses.data;
                if let (Some(indices), Some(address)) = (&mut triangles.indices, addresses.indices)
                {
                    indices.address = address;
                }
                if triangles.transform.is_some() {
                    triangles.transform = addresses.transform.or(triangles.transform);
                }
                BlasGeometryDesc::Triangles(triangles)
            }
            BlasGeometryDesc::Aabbs(mut aabbs) => {
                aabbs.boxes = addresses.data;
                BlasGeometryDesc::Aabbs(aabbs)
            }
        }
    }
}

/// Description of a bottom-level acceleration structure build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlasBuildDesc<'a> {
    pub performance: AccelerationStructurePerformance,
    pub flags: AccelerationStructureBuildFlags,
    pub geometry: &'a [BlasGeometryDesc],
}

/// Description of a top-level acceleration structure build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TlasBuildDesc {
    pub performance: AccelerationStructurePerformance,
    pub flags: AccelerationStructureBuildFlags,

    /// Capacity the structure is sized for.
    pub max_instances: u32,
}

/// Description of acceleration structure storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccelerationStructureDesc<'a> {
    pub level: AccelerationStructureLevel,
    pub size: usize,

    /// Debug name.
    pub name: &'a str,
}
