use std::fmt;

use ash::vk;
use gpu_alloc::MemoryBlock;

use crate::generic::DeviceAddress;

pub struct Buffer {
    pub(super) handle: vk::Buffer,
    pub(super) block: MemoryBlock<vk::DeviceMemory>,
    address: DeviceAddress,
    size: usize,
    pub(super) idx: usize,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .finish()
    }
}

impl Buffer {
    pub(super) fn new(
        handle: vk::Buffer,
        block: MemoryBlock<vk::DeviceMemory>,
        address: DeviceAddress,
        size: usize,
        idx: usize,
    ) -> Self {
        Buffer {
            handle,
            block,
            address,
            size,
            idx,
        }
    }

    #[inline(always)]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }
}

impl crate::traits::Buffer for Buffer {
    #[inline(always)]
    fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    fn address(&self) -> DeviceAddress {
        self.address
    }
}
