use bytemuck::{Pod, Zeroable};

use super::DeviceAddress;

/// Row-major affine transform, three rows of four columns.
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Transform3x4 {
    pub rows: [[f32; 4]; 3],
}

impl Transform3x4 {
    pub const IDENTITY: Self = Transform3x4 {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Size of the transform in bytes as consumed by geometry builds.
    pub const SIZE: usize = 48;

    pub const fn from_rows(rows: [[f32; 4]; 3]) -> Self {
        Transform3x4 { rows }
    }

    pub const fn from_translation(x: f32, y: f32, z: f32) -> Self {
        Transform3x4 {
            rows: [
                [1.0, 0.0, 0.0, x],
                [0.0, 1.0, 0.0, y],
                [0.0, 0.0, 1.0, z],
            ],
        }
    }

    pub fn translation(&self) -> [f32; 3] {
        [self.rows[0][3], self.rows[1][3], self.rows[2][3]]
    }
}

impl Default for Transform3x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_FACING_CULL_DISABLE = 0x1;
        const TRIANGLE_FLIP_FACING = 0x2;
        const FORCE_OPAQUE = 0x4;
        const FORCE_NO_OPAQUE = 0x8;
    }
}

const LOW_24: u32 = 0x00FF_FFFF;

/// One placement of a bottom-level structure in a top-level build.
///
/// Layout matches what devices consume from instance buffers:
/// 24-bit custom index with 8-bit mask, 24-bit binding table offset
/// with 8-bit flags, then the bottom-level structure address.
/// The address is a weak reference, the record owns nothing.
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct InstanceRecord {
    transform: Transform3x4,
    custom_index_mask: u32,
    sbt_offset_flags: u32,
    blas_address: DeviceAddress,
}

impl InstanceRecord {
    pub const SIZE: usize = 64;

    /// New visible-to-all instance with custom index zero and no flags.
    pub fn new(blas_address: DeviceAddress, transform: Transform3x4) -> Self {
        InstanceRecord {
            transform,
            custom_index_mask: 0xFF << 24,
            sbt_offset_flags: 0,
            blas_address,
        }
    }

    pub fn with_custom_index(mut self, custom_index: u32) -> Self {
        debug_assert!(custom_index <= LOW_24, "custom index exceeds 24 bits");
        self.custom_index_mask = (self.custom_index_mask & !LOW_24) | (custom_index & LOW_24);
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.custom_index_mask = (self.custom_index_mask & LOW_24) | (u32::from(mask) << 24);
        self
    }

    pub fn with_sbt_offset(mut self, offset: u32) -> Self {
        debug_assert!(offset <= LOW_24, "binding table offset exceeds 24 bits");
        self.sbt_offset_flags = (self.sbt_offset_flags & !LOW_24) | (offset & LOW_24);
        self
    }

    pub fn with_flags(mut self, flags: InstanceFlags) -> Self {
        self.sbt_offset_flags = (self.sbt_offset_flags & LOW_24) | (u32::from(flags.bits()) << 24);
        self
    }

    pub fn with_blas_address(mut self, address: DeviceAddress) -> Self {
        self.blas_address = address;
        self
    }

    pub fn transform(&self) -> &Transform3x4 {
        &self.transform
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_mask & LOW_24
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_mask >> 24) as u8
    }

    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_flags & LOW_24
    }

    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.sbt_offset_flags >> 24) as u8)
    }

    pub fn blas_address(&self) -> DeviceAddress {
        self.blas_address
    }
}
