use crate::{
    blas::{BlasManager, BlasState},
    config::AccelConfig,
    deferred::DeferredDestructionQueue,
    error::TlasError,
    generic::{
        AccelerationStructureBuildFlags, AccelerationStructureDesc, AccelerationStructureLevel,
        AccelerationStructureSizes, BufferDesc, BufferRange, BufferUsage, DeviceAddress,
        Generation, InstanceRecord, Memory, OutOfMemory, TlasBuildDesc,
    },
    scratch::ScratchPool,
    traits::{AccelerationStructure, Buffer, CommandEncoder, Device},
};

/// State of the top-level structure.
///
/// There is no updated state. Every frame rebuilds from scratch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TlasState {
    Uninitialized,

    /// New structure allocated, build not recorded yet.
    Rebuilding { generation: Generation },

    /// Build of the live structure recorded at `generation`.
    Built { generation: Generation },
}

/// Describes one top-level build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TlasBuildInfo {
    desc: TlasBuildDesc,
    sizes: AccelerationStructureSizes,
    instance_count: u32,
}

impl TlasBuildInfo {
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn sizes(&self) -> AccelerationStructureSizes {
        self.sizes
    }

    pub fn scratch_size(&self) -> usize {
        self.sizes.scratch_size
    }
}

struct InstanceSlot<D: Device> {
    buffer: D::Buffer,
    last_used: Option<Generation>,
}

/// Owner of the single top-level structure.
pub struct TlasManager<D: Device> {
    device: D,
    desc: TlasBuildDesc,
    sizes: AccelerationStructureSizes,
    state: TlasState,
    current: Option<D::AccelerationStructure>,
    pending: Option<D::AccelerationStructure>,
    instance_count: u32,
    scratch: ScratchPool<D>,
    slots: Vec<InstanceSlot<D>>,
    frames_in_flight: usize,
    completed: Option<Generation>,
}

impl<D> TlasManager<D>
where
    D: Device,
{
    pub fn new(device: D, config: &AccelConfig) -> Self {
        let limit = device.limits().max_instance_count;
        let max_instances = if config.max_instances > limit {
            tracing::warn!(
                "TLAS capacity {} exceeds device limit, clamped to {}",
                config.max_instances,
                limit
            );
            limit
        } else {
            config.max_instances
        };

        let desc = TlasBuildDesc {
            performance: config.tlas_performance,
            flags: AccelerationStructureBuildFlags::empty(),
            max_instances,
        };
        let sizes = device.tlas_build_sizes(desc);

        TlasManager {
            scratch: ScratchPool::new(device.clone(), "tlas-scratch"),
            device,
            desc,
            sizes,
            state: TlasState::Uninitialized,
            current: None,
            pending: None,
            instance_count: 0,
            slots: Vec::new(),
            frames_in_flight: config.frames_in_flight.max(1) as usize,
            completed: None,
        }
    }

    pub fn state(&self) -> TlasState {
        self.state
    }

    /// Maximum number of instances, fixed at creation.
    pub fn capacity(&self) -> u32 {
        self.desc.max_instances
    }

    /// Number of instances in the live structure.
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Address of the live structure for binding into ray dispatches.
    pub fn address(&self) -> Option<DeviceAddress> {
        self.current.as_ref().map(|accel| accel.address())
    }

    pub fn current(&self) -> Option<&D::AccelerationStructure> {
        self.current.as_ref()
    }

    pub fn scratch_capacity(&self) -> usize {
        self.scratch.capacity()
    }

    /// Number of instance upload buffers allocated so far.
    pub fn instance_buffers(&self) -> usize {
        self.slots.len()
    }

    /// Rebuilds the structure from `instances` and swaps it in.
    ///
    /// The previous structure is deferred to the encoder's generation.
    pub fn rebuild(
        &mut self,
        instances: &[InstanceRecord],
        blas: &BlasManager<D>,
        deferred: &mut DeferredDestructionQueue<D>,
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<DeviceAddress, TlasError> {
        self.check_capacity(instances.len())?;
        validate_instances(instances, blas)?;

        let generation = encoder.generation();
        let info = self.begin_rebuild(instances.len(), deferred, generation)?;
        self.ensure_scratch(info.scratch_size(), deferred, generation)?;

        let mut slot = self.acquire_slot()?;
        if let Err(err) = self
            .device
            .write_buffer(&mut slot.buffer, 0, bytemuck::cast_slice(instances))
        {
            self.slots.push(slot);
            return Err(err.into());
        }

        let range = BufferRange {
            buffer: &slot.buffer,
            offset: 0,
            size: instances.len() * InstanceRecord::SIZE,
        };
        let result = self.build_with_instances(&info, range, deferred, encoder);

        slot.last_used = Some(generation);
        self.slots.push(slot);
        result
    }

    /// Allocates a new structure for the next build.
    ///
    /// The live structure stays in place until the build is recorded.
    pub fn begin_rebuild(
        &mut self,
        instance_count: usize,
        deferred: &mut DeferredDestructionQueue<D>,
        generation: Generation,
    ) -> Result<TlasBuildInfo, TlasError> {
        self.check_capacity(instance_count)?;

        let accel = self
            .device
            .new_acceleration_structure(AccelerationStructureDesc {
                level: AccelerationStructureLevel::Top,
                size: self.sizes.size,
                name: "tlas",
            })?;

        if let Some(abandoned) = self.pending.replace(accel) {
            deferred.defer_acceleration_structure(generation, abandoned);
        }
        self.state = TlasState::Rebuilding { generation };

        Ok(TlasBuildInfo {
            desc: self.desc,
            sizes: self.sizes,
            instance_count: instance_count as u32,
        })
    }

    /// Grows the persistent scratch buffer to at least `required` bytes.
    pub fn ensure_scratch(
        &mut self,
        required: usize,
        deferred: &mut DeferredDestructionQueue<D>,
        generation: Generation,
    ) -> Result<(), OutOfMemory> {
        self.scratch.ensure(required, deferred, generation)
    }

    /// Records build of the structure allocated by [`TlasManager::begin_rebuild`].
    ///
    /// `instances` must hold `info.instance_count()` records whose
    /// addresses reference live bottom-level structures.
    pub fn build_with_instances(
        &mut self,
        info: &TlasBuildInfo,
        instances: BufferRange<'_, D::Buffer>,
        deferred: &mut DeferredDestructionQueue<D>,
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<DeviceAddress, TlasError> {
        let (TlasState::Rebuilding { .. }, Some(dst)) = (self.state, &self.pending) else {
            return Err(TlasError::NotRebuilding);
        };

        let capacity = instances.size / InstanceRecord::SIZE;
        if capacity < info.instance_count as usize {
            return Err(TlasError::InstanceBufferTooSmall {
                count: info.instance_count,
                capacity,
            });
        }

        let scratch = match self.scratch.range() {
            Some(scratch) if scratch.size >= info.scratch_size() => scratch,
            scratch => {
                return Err(TlasError::InsufficientScratch {
                    required: info.scratch_size(),
                    provided: scratch.map_or(0, |scratch| scratch.size),
                })
            }
        };

        encoder.acceleration_structure_barrier();
        encoder.build_tlas(dst, info.desc, instances, info.instance_count, scratch);
        encoder.acceleration_structure_barrier();

        let generation = encoder.generation();
        let Some(built) = self.pending.take() else {
            return Err(TlasError::NotRebuilding);
        };
        let address = built.address();

        if let Some(old) = self.current.replace(built) {
            deferred.defer_acceleration_structure(generation, old);
        }
        self.instance_count = info.instance_count;
        self.state = TlasState::Built { generation };

        tracing::trace!(
            "TLAS rebuilt with {} instances at {generation}",
            info.instance_count
        );
        Ok(address)
    }

    /// Lets instance buffers used up to `completed` be written again.
    pub fn observe_completed(&mut self, completed: Generation) {
        self.completed = Some(self.completed.map_or(completed, |last| last.max(completed)));
    }

    /// Releases everything once `generation` completes.
    pub fn destroy(&mut self, deferred: &mut DeferredDestructionQueue<D>, generation: Generation) {
        for accel in self.current.take().into_iter().chain(self.pending.take()) {
            deferred.defer_acceleration_structure(generation, accel);
        }
        for slot in self.slots.drain(..) {
            deferred.defer_buffer(generation, slot.buffer);
        }
        self.scratch.release(deferred, generation);
        self.instance_count = 0;
        self.state = TlasState::Uninitialized;
    }

    fn check_capacity(&self, count: usize) -> Result<(), TlasError> {
        if count > self.desc.max_instances as usize {
            return Err(TlasError::TooManyInstances {
                count,
                capacity: self.desc.max_instances,
            });
        }
        Ok(())
    }

    /// Takes an upload buffer that no in-flight command reads.
    fn acquire_slot(&mut self) -> Result<InstanceSlot<D>, OutOfMemory> {
        let completed = self.completed;
        let free = self.slots.iter().position(|slot| match (slot.last_used, completed) {
            (None, _) => true,
            (Some(used), Some(completed)) => used <= completed,
            (Some(_), None) => false,
        });

        if let Some(index) = free {
            return Ok(self.slots.swap_remove(index));
        }

        if self.slots.len() >= self.frames_in_flight {
            tracing::warn!(
                "All {} instance buffers are in flight, allocating another",
                self.slots.len()
            );
        }

        let size = (self.desc.max_instances as usize).max(1) * InstanceRecord::SIZE;
        let buffer = self.device.new_buffer(BufferDesc {
            size,
            align: 16,
            usage: BufferUsage::BUILD_INPUT,
            memory: Memory::Upload,
            name: "tlas-instances",
        })?;
        debug_assert!(buffer.size() >= size);

        Ok(InstanceSlot {
            buffer,
            last_used: None,
        })
    }
}

/// Checks that every instance references a live, recorded bottom-level structure.
pub fn validate_instances<D: Device>(
    instances: &[InstanceRecord],
    blas: &BlasManager<D>,
) -> Result<(), TlasError> {
    for (index, instance) in instances.iter().enumerate() {
        let address = instance.blas_address();
        let Some(id) = blas.lookup(address) else {
            return Err(TlasError::StaleInstance { index, address });
        };
        if let Ok(BlasState::Created) = blas.state(id) {
            return Err(TlasError::UnbuiltInstance { index, id });
        }
    }
    Ok(())
}
