use crate::{
    generic::{
        AccelerationStructureBuildFlags, BlasBuildDesc, BlasGeometryDesc, BufferRange,
        DeviceAddress, Generation, TlasBuildDesc,
    },
    traits::{AccelerationStructure, Buffer, CommandEncoder},
};

use super::{HeadlessAccel, HeadlessBuffer, HeadlessDevice, HeadlessQueryPool};

/// Buffer range captured by a command.
#[derive(Clone, Copy, Debug)]
pub(super) struct Slice {
    pub buffer: DeviceAddress,
    pub offset: usize,
    pub size: usize,
}

impl Slice {
    fn new(range: BufferRange<'_, HeadlessBuffer>) -> Self {
        Slice {
            buffer: range.buffer.address(),
            offset: range.offset,
            size: range.size,
        }
    }

    #[inline(always)]
    pub fn start(&self) -> DeviceAddress {
        self.buffer + self.offset as DeviceAddress
    }

    #[inline(always)]
    pub fn end(&self) -> DeviceAddress {
        self.start() + self.size as DeviceAddress
    }

    /// Checks if slice intersects `start..end`.
    pub fn overlaps(&self, start: DeviceAddress, end: DeviceAddress) -> bool {
        self.start() < end && start < self.end()
    }
}

#[derive(Debug)]
pub(super) enum Command {
    Barrier,
    BuildBlas {
        dst: DeviceAddress,
        src: Option<DeviceAddress>,
        flags: AccelerationStructureBuildFlags,
        geometry: Vec<BlasGeometryDesc>,
        scratch: Slice,
    },
    BuildTlas {
        dst: DeviceAddress,
        desc: TlasBuildDesc,
        instances: Slice,
        count: u32,
        scratch: Slice,
    },
    WriteCompactedSizes {
        structures: Vec<DeviceAddress>,
        pool: u64,
    },
    CopyCompacted {
        src: DeviceAddress,
        dst: DeviceAddress,
    },
    TraceRays {
        tlas: DeviceAddress,
    },
}

/// Command list of [`HeadlessDevice`].
///
/// Commands capture addresses only, resources are resolved when
/// the list executes.
#[derive(Debug)]
pub struct HeadlessEncoder {
    generation: Generation,
    commands: Vec<Command>,
}

impl HeadlessEncoder {
    pub(super) fn new(generation: Generation) -> Self {
        HeadlessEncoder {
            generation,
            commands: Vec::new(),
        }
    }

    pub(super) fn finish(self) -> (Generation, Vec<Command>) {
        (self.generation, self.commands)
    }

    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, Command::Barrier))
            .count()
    }

    /// Number of recorded commands other than barriers.
    pub fn command_count(&self) -> usize {
        self.commands.len() - self.barrier_count()
    }

    /// Records a dispatch tracing one ray against every instance of `tlas`.
    ///
    /// Each execution appends a [`super::Trace`] to the device log.
    pub fn trace_rays(&mut self, tlas: &HeadlessAccel) {
        self.commands.push(Command::TraceRays {
            tlas: tlas.address(),
        });
    }
}

impl CommandEncoder<HeadlessDevice> for HeadlessEncoder {
    #[inline(always)]
    fn generation(&self) -> Generation {
        self.generation
    }

    fn acceleration_structure_barrier(&mut self) {
        self.commands.push(Command::Barrier);
    }

    fn build_blas(
        &mut self,
        dst: &HeadlessAccel,
        src: Option<&HeadlessAccel>,
        desc: BlasBuildDesc,
        scratch: BufferRange<'_, HeadlessBuffer>,
    ) {
        self.commands.push(Command::BuildBlas {
            dst: dst.address(),
            src: src.map(HeadlessAccel::address),
            flags: desc.flags,
            geometry: desc.geometry.to_vec(),
            scratch: Slice::new(scratch),
        });
    }

    fn build_tlas(
        &mut self,
        dst: &HeadlessAccel,
        desc: TlasBuildDesc,
        instances: BufferRange<'_, HeadlessBuffer>,
        count: u32,
        scratch: BufferRange<'_, HeadlessBuffer>,
    ) {
        self.commands.push(Command::BuildTlas {
            dst: dst.address(),
            desc,
            instances: Slice::new(instances),
            count,
            scratch: Slice::new(scratch),
        });
    }

    fn write_compacted_sizes(&mut self, structures: &[&HeadlessAccel], pool: &HeadlessQueryPool) {
        debug_assert!(structures.len() <= pool.count as usize);
        self.commands.push(Command::WriteCompactedSizes {
            structures: structures.iter().map(|accel| accel.address()).collect(),
            pool: pool.id,
        });
    }

    fn copy_compacted(&mut self, src: &HeadlessAccel, dst: &HeadlessAccel) {
        self.commands.push(Command::CopyCompacted {
            src: src.address(),
            dst: dst.address(),
        });
    }
}
