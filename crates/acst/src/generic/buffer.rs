use crate::traits::Buffer;

use super::DeviceAddress;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 0x0000_0001;
        const TRANSFER_DST = 0x0000_0002;
        const STORAGE = 0x0000_0008;
        const INDEX = 0x0000_0010;
        const VERTEX = 0x0000_0020;

        /// Buffer is read by acceleration structure builds.
        /// Geometry, transforms and instances.
        const BUILD_INPUT = 0x0000_0100;

        /// Buffer backs acceleration structure storage.
        const ACCELERATION_STRUCTURE = 0x0000_0200;

        /// Buffer is used as build scratch memory.
        const SCRATCH = 0x0000_0400;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Memory {
    Device,
    Shared,
    Upload,
}

/// Buffer description.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc<'a> {
    /// Buffer size.
    pub size: usize,

    /// Required alignment of the buffer's device address.
    pub align: usize,

    /// Buffer usage flags.
    pub usage: BufferUsage,

    /// Buffer memory type.
    pub memory: Memory,

    /// Buffer debug name.
    pub name: &'a str,
}

/// Sub-range of a buffer.
#[derive(Debug)]
pub struct BufferRange<'a, B> {
    pub buffer: &'a B,
    pub offset: usize,
    pub size: usize,
}

impl<B> Clone for BufferRange<'_, B> {
    #[inline(always)]
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for BufferRange<'_, B> {}

impl<'a, B> BufferRange<'a, B>
where
    B: Buffer,
{
    pub fn whole(buffer: &'a B) -> Self {
        BufferRange {
            buffer,
            offset: 0,
            size: buffer.size(),
        }
    }

    #[inline(always)]
    pub fn address(&self) -> DeviceAddress {
        self.buffer.address() + self.offset as u64
    }

    /// Returns sub-range relative to this range.
    pub fn slice(&self, offset: usize, size: usize) -> Self {
        debug_assert!(offset + size <= self.size, "buffer range out of bounds");
        BufferRange {
            buffer: self.buffer,
            offset: self.offset + offset,
            size,
        }
    }
}
