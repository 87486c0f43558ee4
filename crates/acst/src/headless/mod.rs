//! Device that executes command lists on the host.
//!
//! Resources are tracked by device address, addresses are never reused.
//! Submitted command lists execute when their generation is completed,
//! every command is validated against the state resources have at that
//! moment. Violations are collected instead of causing undefined behavior
//! and can be inspected with [`HeadlessDevice::take_validation_errors`].

mod encoder;
mod execute;

use std::{collections::BTreeMap, fmt, sync::Arc};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::{
    generic::{
        AccelerationStructureDesc, AccelerationStructureLevel, AccelerationStructureSizes,
        BlasBuildDesc, BlasGeometryDesc, BufferDesc, BufferUsage, DeviceAddress, DeviceError,
        DeviceLimits, Generation, Memory, OutOfMemory, TlasBuildDesc, align_up,
    },
    traits::{AccelerationStructure, Buffer, Device},
};

use self::{
    encoder::Command,
    execute::{Content, Executor},
};

pub use self::{
    encoder::HeadlessEncoder,
    execute::{Trace, TraceHit, ValidationError},
};

const ADDRESS_BASE: DeviceAddress = 0x1_0000;
const ADDRESS_ALIGNMENT: usize = 256;

/// Storage size a bottom-level build over `geometry` requires.
fn blas_sizes(geometry: &[BlasGeometryDesc]) -> AccelerationStructureSizes {
    let primitives: usize = geometry.iter().map(|g| g.primitive_count() as usize).sum();
    AccelerationStructureSizes {
        size: align_up(1024 + 96 * primitives + 64 * geometry.len(), ADDRESS_ALIGNMENT),
        scratch_size: align_up(512 + 64 * primitives, ADDRESS_ALIGNMENT),
        update_scratch_size: align_up(256 + 32 * primitives, ADDRESS_ALIGNMENT),
    }
}

fn tlas_sizes(max_instances: u32) -> AccelerationStructureSizes {
    let instances = max_instances as usize;
    AccelerationStructureSizes {
        size: align_up(1024 + 128 * instances, ADDRESS_ALIGNMENT),
        scratch_size: align_up(512 + 64 * instances, ADDRESS_ALIGNMENT),
        update_scratch_size: align_up(256 + 32 * instances, ADDRESS_ALIGNMENT),
    }
}

fn compacted_size(size: usize) -> usize {
    align_up(size * 3 / 5, ADDRESS_ALIGNMENT)
}

#[derive(Debug)]
pub struct HeadlessBuffer {
    address: DeviceAddress,
    size: usize,
}

impl Buffer for HeadlessBuffer {
    #[inline(always)]
    fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    fn address(&self) -> DeviceAddress {
        self.address
    }
}

#[derive(Debug)]
pub struct HeadlessAccel {
    level: AccelerationStructureLevel,
    address: DeviceAddress,
    size: usize,
}

impl AccelerationStructure for HeadlessAccel {
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

#[derive(Debug)]
pub struct HeadlessQueryPool {
    id: u64,
    count: u32,
}

struct BufferState {
    size: usize,
    memory: Memory,
    name: String,
    destroyed: bool,

    /// Host-written contents, grown on first write.
    data: Vec<u8>,
}

struct StructureState {
    level: AccelerationStructureLevel,
    size: usize,
    name: String,
    destroyed: bool,
    content: Option<Content>,
}

struct QueryPoolState {
    sizes: Vec<usize>,
    written: Option<Generation>,
}

/// Everything commands can touch.
#[derive(Default)]
struct Resources {
    allocated: usize,
    next_address: DeviceAddress,
    buffers: BTreeMap<DeviceAddress, BufferState>,
    structures: HashMap<DeviceAddress, StructureState>,
    query_pools: HashMap<u64, QueryPoolState>,
    next_query_pool: u64,
}

impl Resources {
    fn allocate_address(&mut self, size: usize, align: usize) -> DeviceAddress {
        let align = align.max(ADDRESS_ALIGNMENT) as DeviceAddress;
        let base = self.next_address.max(ADDRESS_BASE);
        let address = (base + align - 1) & !(align - 1);
        self.next_address = address + size.max(1) as DeviceAddress;
        address
    }

    /// Finds buffer whose range contains `address`.
    fn buffer_at(&self, address: DeviceAddress) -> Option<(DeviceAddress, &BufferState)> {
        let (&start, state) = self.buffers.range(..=address).next_back()?;
        if address < start + state.size as DeviceAddress {
            Some((start, state))
        } else {
            None
        }
    }
}

struct Submission {
    generation: Generation,
    commands: Vec<Command>,
}

#[derive(Default)]
struct State {
    resources: Resources,
    last_generation: u64,
    pending: Vec<Submission>,
    completed: Generation,
    submitted_commands: usize,
    errors: Vec<ValidationError>,
    traces: Vec<Trace>,
}

struct Inner {
    limits: DeviceLimits,
    memory_budget: Option<usize>,
    query_latency: u64,
    state: Mutex<State>,
}

/// Host-simulated device.
///
/// Cloning produces another handle to the same device.
#[derive(Clone)]
pub struct HeadlessDevice {
    inner: Arc<Inner>,
}

impl fmt::Debug for HeadlessDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadlessDevice")
            .field("limits", &self.inner.limits)
            .field("memory_budget", &self.inner.memory_budget)
            .field("query_latency", &self.inner.query_latency)
            .finish()
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        HeadlessDevice::new(DeviceLimits::default(), None, 0)
    }
}

impl HeadlessDevice {
    /// Creates new device.
    ///
    /// Allocations fail with [`OutOfMemory`] once live resources would exceed
    /// `memory_budget` bytes. Compacted size queries become readable
    /// `query_latency` generations after the command list that wrote them.
    pub fn new(limits: DeviceLimits, memory_budget: Option<usize>, query_latency: u64) -> Self {
        HeadlessDevice {
            inner: Arc::new(Inner {
                limits,
                memory_budget,
                query_latency,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn with_memory_budget(memory_budget: usize) -> Self {
        HeadlessDevice::new(DeviceLimits::default(), Some(memory_budget), 0)
    }

    pub fn with_query_latency(query_latency: u64) -> Self {
        HeadlessDevice::new(DeviceLimits::default(), None, query_latency)
    }

    /// Host-visible buffer for vertices, indices, boxes and transforms.
    pub fn new_geometry_buffer(&self, size: usize) -> Result<HeadlessBuffer, OutOfMemory> {
        self.new_buffer(BufferDesc {
            size,
            align: 16,
            usage: BufferUsage::BUILD_INPUT
                | BufferUsage::VERTEX
                | BufferUsage::INDEX
                | BufferUsage::STORAGE,
            memory: Memory::Shared,
            name: "geometry",
        })
    }

    pub fn new_scratch_buffer(&self, size: usize) -> Result<HeadlessBuffer, OutOfMemory> {
        self.new_buffer(BufferDesc {
            size,
            align: self.inner.limits.min_scratch_offset_alignment,
            usage: BufferUsage::SCRATCH | BufferUsage::STORAGE,
            memory: Memory::Device,
            name: "scratch",
        })
    }

    pub fn new_upload_buffer(&self, size: usize) -> Result<HeadlessBuffer, OutOfMemory> {
        self.new_buffer(BufferDesc {
            size,
            align: 16,
            usage: BufferUsage::BUILD_INPUT | BufferUsage::TRANSFER_SRC,
            memory: Memory::Upload,
            name: "upload",
        })
    }

    /// Starts recording of the next command list.
    ///
    /// Generations are assigned in call order starting from 1.
    pub fn new_encoder(&self) -> HeadlessEncoder {
        let mut state = self.inner.state.lock();
        state.last_generation += 1;
        HeadlessEncoder::new(Generation::new(state.last_generation))
    }

    /// Submits recorded command list for execution.
    ///
    /// Nothing executes until the list's generation is completed.
    pub fn submit(&self, encoder: HeadlessEncoder) {
        let (generation, commands) = encoder.finish();
        tracing::trace!("Submitting {} commands at {generation}", commands.len());

        let mut state = self.inner.state.lock();
        state.submitted_commands += commands.len();

        let position = state
            .pending
            .partition_point(|submission| submission.generation <= generation);
        state.pending.insert(
            position,
            Submission {
                generation,
                commands,
            },
        );

        let completed = state.completed;
        self.execute_until(&mut state, completed);
    }

    /// Executes every submitted command list up to `generation` in order
    /// and marks it complete.
    pub fn complete(&self, generation: Generation) {
        let mut state = self.inner.state.lock();
        state.completed = state.completed.max(generation);
        let completed = state.completed;
        self.execute_until(&mut state, completed);
    }

    /// Executes all submitted command lists.
    ///
    /// Returns the latest completed generation.
    pub fn wait_idle(&self) -> Generation {
        let mut state = self.inner.state.lock();
        if let Some(last) = state.pending.last() {
            state.completed = state.completed.max(last.generation);
        }
        let completed = state.completed;
        self.execute_until(&mut state, completed);
        completed
    }

    fn execute_until(&self, state: &mut State, completed: Generation) {
        let ready = state
            .pending
            .partition_point(|submission| submission.generation <= completed);

        let State {
            resources,
            pending,
            errors,
            traces,
            ..
        } = state;

        for submission in pending.drain(..ready) {
            Executor::new(
                resources,
                &self.inner.limits,
                submission.generation,
                errors,
                traces,
            )
            .run(submission.commands);
        }
    }

    pub fn live_buffers(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .resources
            .buffers
            .values()
            .filter(|buffer| !buffer.destroyed)
            .count()
    }

    pub fn live_acceleration_structures(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .resources
            .structures
            .values()
            .filter(|accel| !accel.destroyed)
            .count()
    }

    /// Total number of commands submitted so far, barriers included.
    pub fn submitted_commands(&self) -> usize {
        self.inner.state.lock().submitted_commands
    }

    pub fn take_validation_errors(&self) -> Vec<ValidationError> {
        std::mem::take(&mut self.inner.state.lock().errors)
    }

    pub fn take_traces(&self) -> Vec<Trace> {
        std::mem::take(&mut self.inner.state.lock().traces)
    }

    fn reserve(&self, resources: &mut Resources, size: usize) -> Result<(), OutOfMemory> {
        if let Some(budget) = self.inner.memory_budget {
            if resources.allocated + size > budget {
                tracing::debug!(
                    "Allocation of {size} bytes exceeds budget, {} of {budget} bytes in use",
                    resources.allocated
                );
                return Err(OutOfMemory);
            }
        }
        resources.allocated += size;
        Ok(())
    }
}

impl Device for HeadlessDevice {
    type Buffer = HeadlessBuffer;
    type AccelerationStructure = HeadlessAccel;
    type QueryPool = HeadlessQueryPool;

    fn limits(&self) -> &DeviceLimits {
        &self.inner.limits
    }

    fn new_buffer(&self, desc: BufferDesc) -> Result<HeadlessBuffer, OutOfMemory> {
        let mut state = self.inner.state.lock();
        let resources = &mut state.resources;
        self.reserve(resources, desc.size)?;

        let address = resources.allocate_address(desc.size, desc.align);
        resources.buffers.insert(
            address,
            BufferState {
                size: desc.size,
                memory: desc.memory,
                name: desc.name.to_owned(),
                destroyed: false,
                data: Vec::new(),
            },
        );

        Ok(HeadlessBuffer {
            address,
            size: desc.size,
        })
    }

    fn write_buffer(
        &self,
        buffer: &mut HeadlessBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), OutOfMemory> {
        let mut state = self.inner.state.lock();
        let State {
            resources,
            pending,
            errors,
            ..
        } = &mut *state;

        let start = buffer.address + offset as DeviceAddress;
        let end = start + data.len() as DeviceAddress;

        for submission in pending.iter() {
            let in_flight = submission.commands.iter().any(|command| match command {
                Command::BuildTlas { instances, .. } => instances.overlaps(start, end),
                _ => false,
            });
            if in_flight {
                errors.push(ValidationError::HostWriteInFlight {
                    generation: submission.generation,
                    address: buffer.address,
                });
            }
        }

        let Some(target) = resources.buffers.get_mut(&buffer.address) else {
            errors.push(ValidationError::InvalidHostWrite {
                address: buffer.address,
                reason: "buffer does not exist",
            });
            return Ok(());
        };

        let reason = if target.destroyed {
            Some("buffer was destroyed")
        } else if target.memory == Memory::Device {
            Some("buffer is not host visible")
        } else if offset + data.len() > target.size {
            Some("write is out of bounds")
        } else {
            None
        };

        if let Some(reason) = reason {
            tracing::error!("Invalid write to buffer '{}': {reason}", target.name);
            errors.push(ValidationError::InvalidHostWrite {
                address: buffer.address,
                reason,
            });
            return Ok(());
        }

        if target.data.len() < offset + data.len() {
            target.data.resize(target.size, 0);
        }
        target.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: HeadlessBuffer) {
        let mut state = self.inner.state.lock();
        let resources = &mut state.resources;
        if let Some(target) = resources.buffers.get_mut(&buffer.address) {
            debug_assert!(!target.destroyed, "buffer destroyed twice");
            target.destroyed = true;
            target.data = Vec::new();
            resources.allocated -= target.size;
        }
    }

    fn blas_build_sizes(&self, desc: BlasBuildDesc) -> AccelerationStructureSizes {
        blas_sizes(desc.geometry)
    }

    fn tlas_build_sizes(&self, desc: TlasBuildDesc) -> AccelerationStructureSizes {
        tlas_sizes(desc.max_instances)
    }

    fn new_acceleration_structure(
        &self,
        desc: AccelerationStructureDesc,
    ) -> Result<HeadlessAccel, OutOfMemory> {
        let mut state = self.inner.state.lock();
        let resources = &mut state.resources;
        self.reserve(resources, desc.size)?;

        let address =
            resources.allocate_address(desc.size, self.inner.limits.acceleration_structure_alignment);
        resources.structures.insert(
            address,
            StructureState {
                level: desc.level,
                size: desc.size,
                name: desc.name.to_owned(),
                destroyed: false,
                content: None,
            },
        );

        Ok(HeadlessAccel {
            level: desc.level,
            address,
            size: desc.size,
        })
    }

    fn destroy_acceleration_structure(&self, accel: HeadlessAccel) {
        let mut state = self.inner.state.lock();
        let resources = &mut state.resources;
        if let Some(target) = resources.structures.get_mut(&accel.address) {
            debug_assert!(!target.destroyed, "acceleration structure destroyed twice");
            tracing::trace!("Destroying acceleration structure '{}'", target.name);
            target.destroyed = true;
            target.content = None;
            resources.allocated -= target.size;
        }
    }

    fn new_compacted_size_queries(&self, count: u32) -> Result<HeadlessQueryPool, OutOfMemory> {
        let mut state = self.inner.state.lock();
        let resources = &mut state.resources;
        let id = resources.next_query_pool;
        resources.next_query_pool += 1;
        resources.query_pools.insert(
            id,
            QueryPoolState {
                sizes: vec![0; count as usize],
                written: None,
            },
        );
        Ok(HeadlessQueryPool { id, count })
    }

    fn compacted_sizes(
        &self,
        pool: &HeadlessQueryPool,
        count: u32,
    ) -> Result<Option<Vec<usize>>, DeviceError> {
        debug_assert!(count <= pool.count);

        let state = self.inner.state.lock();
        let Some(queries) = state.resources.query_pools.get(&pool.id) else {
            return Err(DeviceError::DeviceLost);
        };

        match queries.written {
            Some(written) if state.completed.get() >= written.get() + self.inner.query_latency => {
                Ok(Some(queries.sizes[..count as usize].to_vec()))
            }
            _ => Ok(None),
        }
    }

    fn destroy_query_pool(&self, pool: HeadlessQueryPool) {
        let mut state = self.inner.state.lock();
        state.resources.query_pools.remove(&pool.id);
    }
}
