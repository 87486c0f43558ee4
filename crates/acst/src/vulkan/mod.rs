//! Backend on top of `VK_KHR_acceleration_structure`.
//!
//! The device is created by the application with acceleration structure
//! and buffer device address features enabled.
//! Command buffers are begun, submitted and synchronized by the application,
//! [`CommandEncoder`] only records into them.

use std::alloc::Layout;

use ash::vk;

use crate::generic::Memory;

mod acst;
mod buffer;
mod command;
mod device;
mod from;

pub use self::{
    acst::AccelerationStructure,
    buffer::Buffer,
    command::CommandEncoder,
    device::{Device, QueryPool},
};

#[track_caller]
fn handle_host_oom() -> ! {
    std::alloc::handle_alloc_error(Layout::new::<()>())
}

#[track_caller]
fn unexpected_error(err: vk::Result) -> ! {
    unreachable!("unexpected error: {err:?}")
}

fn memory_to_usage_flags(memory: Memory) -> gpu_alloc::UsageFlags {
    let flags = match memory {
        Memory::Device => gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS,
        Memory::Shared => gpu_alloc::UsageFlags::HOST_ACCESS,
        Memory::Upload => gpu_alloc::UsageFlags::HOST_ACCESS | gpu_alloc::UsageFlags::UPLOAD,
    };
    flags | gpu_alloc::UsageFlags::DEVICE_ADDRESS
}
