/// Device limits relevant to acceleration structure builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceLimits {
    /// Required alignment of scratch buffer addresses.
    pub min_scratch_offset_alignment: usize,

    /// Alignment of acceleration structure storage offsets.
    pub acceleration_structure_alignment: usize,

    pub max_geometry_count: u32,
    pub max_instance_count: u32,
    pub max_primitive_count: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        DeviceLimits {
            min_scratch_offset_alignment: 128,
            acceleration_structure_alignment: 256,
            max_geometry_count: 1 << 24,
            max_instance_count: 1 << 24,
            max_primitive_count: 1 << 29,
        }
    }
}
