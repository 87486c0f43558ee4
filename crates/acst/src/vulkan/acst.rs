use ash::vk;

use crate::generic::{AccelerationStructureLevel, DeviceAddress};

use super::buffer::Buffer;

/// Acceleration structure placed at the start of its own buffer.
#[derive(Debug)]
pub struct AccelerationStructure {
    pub(super) handle: vk::AccelerationStructureKHR,
    pub(super) buffer: Buffer,
    level: AccelerationStructureLevel,
    address: DeviceAddress,
    size: usize,
    pub(super) idx: usize,
}

impl AccelerationStructure {
    pub(super) fn new(
        handle: vk::AccelerationStructureKHR,
        buffer: Buffer,
        level: AccelerationStructureLevel,
        address: DeviceAddress,
        size: usize,
        idx: usize,
    ) -> Self {
        AccelerationStructure {
            handle,
            buffer,
            level,
            address,
            size,
            idx,
        }
    }

    #[inline(always)]
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }
}

impl crate::traits::AccelerationStructure for AccelerationStructure {
    #[inline(always)]
    fn level(&self) -> AccelerationStructureLevel {
        self.level
    }

    #[inline(always)]
    fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    fn address(&self) -> DeviceAddress {
        self.address
    }
}
