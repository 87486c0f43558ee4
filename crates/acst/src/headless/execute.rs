use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use bytemuck::Zeroable;
use hashbrown::HashSet;
use smallvec::SmallVec;

use crate::generic::{
    AccelerationStructureBuildFlags, AccelerationStructureLevel, BlasGeometryDesc, BuildMode,
    DeviceAddress, DeviceLimits, Generation, InstanceFlags, InstanceRecord, TlasBuildDesc,
    Transform3x4,
};

use super::{
    blas_sizes, compacted_size,
    encoder::{Command, Slice},
    tlas_sizes, Resources, StructureState,
};

/// Misuse detected while executing a command list.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{generation}: {resource} at {address:#x} used after it was destroyed")]
    UseAfterFree {
        generation: Generation,
        resource: &'static str,
        address: DeviceAddress,
    },

    #[error("{generation}: address {address:#x} does not belong to any resource")]
    UnboundAddress {
        generation: Generation,
        address: DeviceAddress,
    },

    #[error("{generation}: {resource} range at {address:#x} of {size} bytes exceeds its buffer")]
    InputOutOfBounds {
        generation: Generation,
        resource: &'static str,
        address: DeviceAddress,
        size: usize,
    },

    #[error("{generation}: structure at {address:#x} has {found:?} level")]
    LevelMismatch {
        generation: Generation,
        address: DeviceAddress,
        found: AccelerationStructureLevel,
    },

    #[error("{generation}: structure at {address:#x} has {available} bytes, build needs {required}")]
    StorageTooSmall {
        generation: Generation,
        address: DeviceAddress,
        required: usize,
        available: usize,
    },

    #[error("{generation}: scratch range of {provided} bytes, build needs {required}")]
    InsufficientScratch {
        generation: Generation,
        required: usize,
        provided: usize,
    },

    #[error("{generation}: scratch address {address:#x} is not aligned to {alignment} bytes")]
    MisalignedScratch {
        generation: Generation,
        address: DeviceAddress,
        alignment: usize,
    },

    #[error("{generation}: scratch at {address:#x} is shared with a build after the last barrier")]
    ScratchOverlap {
        generation: Generation,
        address: DeviceAddress,
    },

    #[error("{generation}: structure at {address:#x} is read without a barrier after its write")]
    MissingBarrier {
        generation: Generation,
        address: DeviceAddress,
    },

    #[error("{generation}: structure at {address:#x} is read before it was built")]
    Unbuilt {
        generation: Generation,
        address: DeviceAddress,
    },

    #[error("{generation}: update source at {address:#x} was built without update support")]
    UpdateNotAllowed {
        generation: Generation,
        address: DeviceAddress,
    },

    #[error("{generation}: update of {address:#x} changes geometry layout or primitive counts")]
    UpdateMismatch {
        generation: Generation,
        address: DeviceAddress,
    },

    #[error("{generation}: structure at {address:#x} was built without compaction support")]
    CompactionNotAllowed {
        generation: Generation,
        address: DeviceAddress,
    },

    #[error("{generation}: instance {index} references {address:#x} which is not a built bottom-level structure")]
    InvalidInstance {
        generation: Generation,
        index: usize,
        address: DeviceAddress,
    },

    #[error("{generation}: build reads {count} instances, structure is sized for {capacity}")]
    TooManyInstances {
        generation: Generation,
        count: u32,
        capacity: u32,
    },

    #[error("{generation}: instance range of {provided} bytes, build reads {required}")]
    InstanceRangeTooSmall {
        generation: Generation,
        required: usize,
        provided: usize,
    },

    #[error("{generation}: query pool {pool} used after it was destroyed")]
    QueryPoolDestroyed { generation: Generation, pool: u64 },

    #[error("host write to buffer at {address:#x}: {reason}")]
    InvalidHostWrite {
        address: DeviceAddress,
        reason: &'static str,
    },

    #[error("host write to buffer at {address:#x} overlaps range read by in-flight {generation}")]
    HostWriteInFlight {
        generation: Generation,
        address: DeviceAddress,
    },
}

/// Instance hit by a traced ray.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceHit {
    pub custom_index: u32,
    pub mask: u8,
    pub flags: InstanceFlags,
    pub transform: Transform3x4,

    /// Identifies the geometry of the bottom-level structure.
    /// Survives compaction, changes with geometry.
    pub geometry: u64,
}

/// Result of one executed trace dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct Trace {
    pub generation: Generation,
    pub hits: Vec<TraceHit>,
}

/// What a built structure holds.
#[derive(Clone, Debug)]
pub(super) enum Content {
    Bottom {
        flags: AccelerationStructureBuildFlags,
        geometry: Vec<BlasGeometryDesc>,

        /// Size the build required, basis of the compacted size.
        required: usize,
        fingerprint: u64,
    },
    Top {
        instances: Vec<InstanceRecord>,
    },
}

fn fingerprint(geometry: &[BlasGeometryDesc]) -> u64 {
    let mut hasher = DefaultHasher::new();
    geometry.hash(&mut hasher);
    hasher.finish()
}

/// Byte ranges a geometry build reads.
fn extents(geometry: &BlasGeometryDesc) -> SmallVec<[(DeviceAddress, usize, &'static str); 3]> {
    let mut extents = SmallVec::new();
    match geometry {
        BlasGeometryDesc::Triangles(triangles) => {
            let vertices = triangles.vertex_stride * triangles.max_vertex as usize
                + triangles.vertex_format.size();
            extents.push((triangles.vertices, vertices, "vertex buffer"));

            if let Some(indices) = triangles.indices {
                let size = indices.format.size() * 3 * triangles.primitive_count as usize;
                extents.push((indices.address, size, "index buffer"));
            }
            if let Some(transform) = triangles.transform {
                extents.push((transform, Transform3x4::SIZE, "transform buffer"));
            }
        }
        BlasGeometryDesc::Aabbs(aabbs) => {
            if aabbs.primitive_count > 0 {
                let size = aabbs.box_stride * (aabbs.primitive_count as usize - 1) + 24;
                extents.push((aabbs.boxes, size, "box buffer"));
            }
        }
    }
    extents
}

/// Executes one command list against device resources.
pub(super) struct Executor<'a> {
    resources: &'a mut Resources,
    limits: &'a DeviceLimits,
    generation: Generation,
    errors: &'a mut Vec<ValidationError>,
    traces: &'a mut Vec<Trace>,

    /// Structures written since the last barrier.
    written: HashSet<DeviceAddress>,

    /// Scratch ranges used since the last barrier.
    scratch: Vec<Slice>,
}

impl<'a> Executor<'a> {
    pub fn new(
        resources: &'a mut Resources,
        limits: &'a DeviceLimits,
        generation: Generation,
        errors: &'a mut Vec<ValidationError>,
        traces: &'a mut Vec<Trace>,
    ) -> Self {
        Executor {
            resources,
            limits,
            generation,
            errors,
            traces,
            written: HashSet::new(),
            scratch: Vec::new(),
        }
    }

    pub fn run(mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Barrier => {
                    self.written.clear();
                    self.scratch.clear();
                }
                Command::BuildBlas {
                    dst,
                    src,
                    flags,
                    geometry,
                    scratch,
                } => self.build_blas(dst, src, flags, geometry, scratch),
                Command::BuildTlas {
                    dst,
                    desc,
                    instances,
                    count,
                    scratch,
                } => self.build_tlas(dst, desc, instances, count, scratch),
                Command::WriteCompactedSizes { structures, pool } => {
                    self.write_compacted_sizes(&structures, pool)
                }
                Command::CopyCompacted { src, dst } => self.copy_compacted(src, dst),
                Command::TraceRays { tlas } => self.trace_rays(tlas),
            }
        }
    }

    fn report(&mut self, error: ValidationError) {
        tracing::error!("{error}");
        self.errors.push(error);
    }

    fn structure(
        &self,
        address: DeviceAddress,
        resource: &'static str,
    ) -> Result<&StructureState, ValidationError> {
        match self.resources.structures.get(&address) {
            Some(state) if !state.destroyed => Ok(state),
            Some(_) => Err(ValidationError::UseAfterFree {
                generation: self.generation,
                resource,
                address,
            }),
            None => Err(ValidationError::UnboundAddress {
                generation: self.generation,
                address,
            }),
        }
    }

    /// Resolves structure read by a command.
    fn read(&self, address: DeviceAddress, resource: &'static str) -> Result<&Content, ValidationError> {
        let state = self.structure(address, resource)?;
        if self.written.contains(&address) {
            return Err(ValidationError::MissingBarrier {
                generation: self.generation,
                address,
            });
        }
        state.content.as_ref().ok_or(ValidationError::Unbuilt {
            generation: self.generation,
            address,
        })
    }

    /// Checks structure written by a command.
    fn target(
        &self,
        address: DeviceAddress,
        level: AccelerationStructureLevel,
        required: usize,
    ) -> Result<(), ValidationError> {
        let state = self.structure(address, "destination structure")?;
        if state.level != level {
            return Err(ValidationError::LevelMismatch {
                generation: self.generation,
                address,
                found: state.level,
            });
        }
        if state.size < required {
            return Err(ValidationError::StorageTooSmall {
                generation: self.generation,
                address,
                required,
                available: state.size,
            });
        }
        Ok(())
    }

    fn store(&mut self, address: DeviceAddress, content: Content) {
        if let Some(state) = self.resources.structures.get_mut(&address) {
            state.content = Some(content);
        }
        self.written.insert(address);
    }

    fn check_input(
        &self,
        address: DeviceAddress,
        size: usize,
        resource: &'static str,
    ) -> Result<(), ValidationError> {
        match self.resources.buffer_at(address) {
            None => Err(ValidationError::UnboundAddress {
                generation: self.generation,
                address,
            }),
            Some((_, buffer)) if buffer.destroyed => Err(ValidationError::UseAfterFree {
                generation: self.generation,
                resource,
                address,
            }),
            Some((start, buffer))
                if address + size as DeviceAddress > start + buffer.size as DeviceAddress =>
            {
                Err(ValidationError::InputOutOfBounds {
                    generation: self.generation,
                    resource,
                    address,
                    size,
                })
            }
            Some(_) => Ok(()),
        }
    }

    fn check_scratch(&mut self, scratch: Slice, required: usize) -> bool {
        let alignment = self.limits.min_scratch_offset_alignment.max(1);
        let error = match self.resources.buffers.get(&scratch.buffer) {
            None => Some(ValidationError::UnboundAddress {
                generation: self.generation,
                address: scratch.buffer,
            }),
            Some(buffer) if buffer.destroyed => Some(ValidationError::UseAfterFree {
                generation: self.generation,
                resource: "scratch buffer",
                address: scratch.buffer,
            }),
            Some(_) if scratch.size < required => Some(ValidationError::InsufficientScratch {
                generation: self.generation,
                required,
                provided: scratch.size,
            }),
            Some(_) if scratch.start() % alignment as DeviceAddress != 0 => {
                Some(ValidationError::MisalignedScratch {
                    generation: self.generation,
                    address: scratch.start(),
                    alignment,
                })
            }
            Some(_)
                if self
                    .scratch
                    .iter()
                    .any(|used| used.overlaps(scratch.start(), scratch.start() + required as DeviceAddress)) =>
            {
                Some(ValidationError::ScratchOverlap {
                    generation: self.generation,
                    address: scratch.start(),
                })
            }
            Some(_) => None,
        };

        match error {
            Some(error) => {
                self.report(error);
                false
            }
            None => {
                self.scratch.push(Slice {
                    size: required,
                    ..scratch
                });
                true
            }
        }
    }

    fn build_blas(
        &mut self,
        dst: DeviceAddress,
        src: Option<DeviceAddress>,
        flags: AccelerationStructureBuildFlags,
        geometry: Vec<BlasGeometryDesc>,
        scratch: Slice,
    ) {
        let sizes = blas_sizes(&geometry);
        let mode = match src {
            None => BuildMode::Build,
            Some(_) => BuildMode::Update,
        };

        if !self.check_scratch(scratch, sizes.scratch_for(mode)) {
            return;
        }

        for desc in &geometry {
            for (address, size, resource) in extents(desc) {
                if let Err(error) = self.check_input(address, size, resource) {
                    self.report(error);
                    return;
                }
            }
        }

        if let Some(src) = src {
            let error = match self.read(src, "update source") {
                Err(error) => Some(error),
                Ok(Content::Top { .. }) => Some(ValidationError::LevelMismatch {
                    generation: self.generation,
                    address: src,
                    found: AccelerationStructureLevel::Top,
                }),
                Ok(Content::Bottom { flags, .. })
                    if !flags.contains(AccelerationStructureBuildFlags::ALLOW_UPDATE) =>
                {
                    Some(ValidationError::UpdateNotAllowed {
                        generation: self.generation,
                        address: src,
                    })
                }
                Ok(Content::Bottom {
                    geometry: previous, ..
                }) => {
                    let matches = previous.len() == geometry.len()
                        && previous.iter().zip(&geometry).all(|(a, b)| {
                            a.same_topology(b) && a.primitive_count() == b.primitive_count()
                        });
                    if matches {
                        None
                    } else {
                        Some(ValidationError::UpdateMismatch {
                            generation: self.generation,
                            address: src,
                        })
                    }
                }
            };

            if let Some(error) = error {
                self.report(error);
                return;
            }
        }

        let required = match src {
            Some(src) if src == dst => 0,
            _ => sizes.size,
        };
        if let Err(error) = self.target(dst, AccelerationStructureLevel::Bottom, required) {
            self.report(error);
            return;
        }

        let content = Content::Bottom {
            flags,
            fingerprint: fingerprint(&geometry),
            required: sizes.size,
            geometry,
        };
        self.store(dst, content);
    }

    fn build_tlas(
        &mut self,
        dst: DeviceAddress,
        desc: TlasBuildDesc,
        instances: Slice,
        count: u32,
        scratch: Slice,
    ) {
        let sizes = tlas_sizes(desc.max_instances);

        if !self.check_scratch(scratch, sizes.scratch_size) {
            return;
        }

        if count > desc.max_instances {
            self.report(ValidationError::TooManyInstances {
                generation: self.generation,
                count,
                capacity: desc.max_instances,
            });
            return;
        }

        let required = count as usize * InstanceRecord::SIZE;
        if instances.size < required {
            self.report(ValidationError::InstanceRangeTooSmall {
                generation: self.generation,
                required,
                provided: instances.size,
            });
            return;
        }

        let records = match self.resources.buffers.get(&instances.buffer) {
            None => Err(ValidationError::UnboundAddress {
                generation: self.generation,
                address: instances.buffer,
            }),
            Some(buffer) if buffer.destroyed => Err(ValidationError::UseAfterFree {
                generation: self.generation,
                resource: "instance buffer",
                address: instances.buffer,
            }),
            Some(buffer) => Ok((0..count as usize)
                .map(|index| {
                    let start = instances.offset + index * InstanceRecord::SIZE;
                    // Never written memory reads as zeroes.
                    match buffer.data.get(start..start + InstanceRecord::SIZE) {
                        Some(bytes) => bytemuck::pod_read_unaligned(bytes),
                        None => InstanceRecord::zeroed(),
                    }
                })
                .collect::<Vec<InstanceRecord>>()),
        };

        let records = match records {
            Ok(records) => records,
            Err(error) => {
                self.report(error);
                return;
            }
        };

        for (index, record) in records.iter().enumerate() {
            let address = record.blas_address();
            match self.read(address, "instanced structure") {
                Ok(Content::Bottom { .. }) => {}
                Err(error @ ValidationError::MissingBarrier { .. }) => self.report(error),
                _ => self.report(ValidationError::InvalidInstance {
                    generation: self.generation,
                    index,
                    address,
                }),
            }
        }

        if let Err(error) = self.target(dst, AccelerationStructureLevel::Top, sizes.size) {
            self.report(error);
            return;
        }

        self.store(dst, Content::Top { instances: records });
    }

    fn write_compacted_sizes(&mut self, structures: &[DeviceAddress], pool: u64) {
        let mut sizes = Vec::with_capacity(structures.len());

        for &address in structures {
            let size = match self.read(address, "compaction candidate") {
                Ok(Content::Bottom {
                    flags, required, ..
                }) if flags.contains(AccelerationStructureBuildFlags::ALLOW_COMPACTION) => {
                    Ok(compacted_size(*required))
                }
                Ok(Content::Bottom { .. }) => Err(ValidationError::CompactionNotAllowed {
                    generation: self.generation,
                    address,
                }),
                Ok(Content::Top { .. }) => Err(ValidationError::LevelMismatch {
                    generation: self.generation,
                    address,
                    found: AccelerationStructureLevel::Top,
                }),
                Err(error) => Err(error),
            };

            match size {
                Ok(size) => sizes.push(size),
                Err(error) => {
                    self.report(error);
                    sizes.push(0);
                }
            }
        }

        match self.resources.query_pools.get_mut(&pool) {
            Some(queries) => {
                queries.sizes[..sizes.len()].copy_from_slice(&sizes);
                queries.written = Some(self.generation);
            }
            None => self.report(ValidationError::QueryPoolDestroyed {
                generation: self.generation,
                pool,
            }),
        }
    }

    fn copy_compacted(&mut self, src: DeviceAddress, dst: DeviceAddress) {
        let content = match self.read(src, "compaction source") {
            Ok(content) => content.clone(),
            Err(error) => {
                self.report(error);
                return;
            }
        };

        let required = match &content {
            Content::Bottom {
                flags, required, ..
            } if flags.contains(AccelerationStructureBuildFlags::ALLOW_COMPACTION) => {
                compacted_size(*required)
            }
            Content::Bottom { .. } => {
                self.report(ValidationError::CompactionNotAllowed {
                    generation: self.generation,
                    address: src,
                });
                return;
            }
            Content::Top { .. } => {
                self.report(ValidationError::LevelMismatch {
                    generation: self.generation,
                    address: src,
                    found: AccelerationStructureLevel::Top,
                });
                return;
            }
        };

        if let Err(error) = self.target(dst, AccelerationStructureLevel::Bottom, required) {
            self.report(error);
            return;
        }

        self.store(dst, content);
    }

    fn trace_rays(&mut self, tlas: DeviceAddress) {
        let instances = match self.read(tlas, "traced structure") {
            Ok(Content::Top { instances }) => instances.clone(),
            Ok(Content::Bottom { .. }) => {
                self.report(ValidationError::LevelMismatch {
                    generation: self.generation,
                    address: tlas,
                    found: AccelerationStructureLevel::Bottom,
                });
                return;
            }
            Err(error) => {
                self.report(error);
                return;
            }
        };

        let mut hits = Vec::with_capacity(instances.len());
        for (index, record) in instances.iter().enumerate() {
            let address = record.blas_address();
            let geometry = match self.read(address, "instanced structure") {
                Ok(Content::Bottom { fingerprint, .. }) => Ok(*fingerprint),
                Err(error @ ValidationError::MissingBarrier { .. }) => Err(error),
                _ => Err(ValidationError::InvalidInstance {
                    generation: self.generation,
                    index,
                    address,
                }),
            };

            match geometry {
                Ok(geometry) => hits.push(TraceHit {
                    custom_index: record.custom_index(),
                    mask: record.mask(),
                    flags: record.flags(),
                    transform: *record.transform(),
                    geometry,
                }),
                Err(error) => self.report(error),
            }
        }

        self.traces.push(Trace {
            generation: self.generation,
            hits,
        });
    }
}
