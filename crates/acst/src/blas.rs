use hashbrown::HashMap;
use slab::Slab;
use smallvec::SmallVec;

use crate::{
    compaction::{CompactionPipeline, CompactionRequest},
    deferred::DeferredDestructionQueue,
    error::{BuildError, CompactionError, RefitError, UnknownBlas},
    generic::{
        AccelerationStructureBuildFlags, AccelerationStructureDesc, AccelerationStructureLevel,
        AccelerationStructurePerformance, AccelerationStructureSizes, BlasBuildDesc,
        BlasGeometryDesc, BufferRange, BuildMode, DeviceAddress, GeometryAddresses, Generation,
    },
    scratch::{scratch_layout, ScratchPool},
    traits::{AccelerationStructure, CommandEncoder, Device},
};

/// Handle of a bottom-level structure owned by [`BlasManager`].
///
/// Handles of destroyed structures are never confused with live ones,
/// even when the slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlasId {
    key: usize,
    serial: u64,
}

/// Description of a new bottom-level structure.
#[derive(Clone, Copy, Debug)]
pub struct BlasDesc<'a> {
    pub geometry: &'a [BlasGeometryDesc],
    pub flags: AccelerationStructureBuildFlags,
    pub performance: AccelerationStructurePerformance,

    /// Debug name.
    pub name: &'a str,
}

/// Everything needed to record a build of one bottom-level structure.
///
/// The manager keeps the last recorded info of every structure,
/// it is the only record of how the structure was built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlasBuildInfo {
    id: BlasId,
    mode: BuildMode,
    performance: AccelerationStructurePerformance,
    flags: AccelerationStructureBuildFlags,
    geometry: Vec<BlasGeometryDesc>,
    sizes: AccelerationStructureSizes,
}

impl BlasBuildInfo {
    pub fn id(&self) -> BlasId {
        self.id
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    pub fn flags(&self) -> AccelerationStructureBuildFlags {
        self.flags
    }

    pub fn geometry(&self) -> &[BlasGeometryDesc] {
        &self.geometry
    }

    pub fn sizes(&self) -> AccelerationStructureSizes {
        self.sizes
    }

    /// Scratch memory this build consumes.
    pub fn scratch_size(&self) -> usize {
        self.sizes.scratch_for(self.mode)
    }

    fn desc(&self) -> BlasBuildDesc<'_> {
        BlasBuildDesc {
            performance: self.performance,
            flags: self.flags,
            geometry: &self.geometry,
        }
    }
}

/// Per-geometry part of a refit.
#[derive(Clone, Copy, Debug)]
pub enum GeometryUpdate<'a> {
    /// Refit from the same buffers, their content changed.
    Unchanged,

    /// Geometry moved to new addresses, one entry per geometry.
    Addresses(&'a [GeometryAddresses]),

    /// New descriptors with the same topology and primitive counts.
    Geometry(&'a [BlasGeometryDesc]),
}

#[derive(Clone, Copy, Debug)]
pub struct BlasUpdate<'a> {
    pub blas: BlasId,
    pub geometry: GeometryUpdate<'a>,
}

/// Host-side knowledge about a structure's content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlasState {
    /// Storage allocated, nothing recorded.
    Created,

    /// Build, update or compacting copy recorded in a command list
    /// of this generation, completion not yet observed.
    Recorded(Generation),

    /// Last recorded write is known to be complete.
    Built,
}

struct BlasEntry<D: Device> {
    serial: u64,
    name: String,
    accel: D::AccelerationStructure,

    /// Info of the initial build, updates keep its flags and sizes.
    info: BlasBuildInfo,
    state: BlasState,
    compaction_pending: bool,
}

/// Owner of all bottom-level structures.
pub struct BlasManager<D: Device> {
    device: D,
    entries: Slab<BlasEntry<D>>,
    by_address: HashMap<DeviceAddress, BlasId>,
    next_serial: u64,
}

impl<D> BlasManager<D>
where
    D: Device,
{
    pub fn new(device: D) -> Self {
        BlasManager {
            device,
            entries: Slab::new(),
            by_address: HashMap::new(),
            next_serial: 0,
        }
    }

    fn entry(&self, id: BlasId) -> Result<&BlasEntry<D>, UnknownBlas> {
        match self.entries.get(id.key) {
            Some(entry) if entry.serial == id.serial => Ok(entry),
            _ => Err(UnknownBlas(id)),
        }
    }

    fn entry_mut(&mut self, id: BlasId) -> Result<&mut BlasEntry<D>, UnknownBlas> {
        match self.entries.get_mut(id.key) {
            Some(entry) if entry.serial == id.serial => Ok(entry),
            _ => Err(UnknownBlas(id)),
        }
    }

    /// Allocates storage for a new structure without building it.
    ///
    /// Storage is sized by the device's pre-build size query.
    /// Record the returned info with [`BlasManager::build`].
    pub fn create(&mut self, desc: BlasDesc<'_>) -> Result<(BlasId, BlasBuildInfo), BuildError> {
        let limits = self.device.limits();
        if desc.geometry.len() > limits.max_geometry_count as usize {
            return Err(BuildError::TooManyGeometries {
                count: desc.geometry.len(),
                limit: limits.max_geometry_count,
            });
        }

        let primitives: u64 = desc
            .geometry
            .iter()
            .map(|g| u64::from(g.primitive_count()))
            .sum();
        if primitives > u64::from(limits.max_primitive_count) {
            return Err(BuildError::TooManyPrimitives {
                count: primitives,
                limit: limits.max_primitive_count,
            });
        }

        let sizes = self.device.blas_build_sizes(BlasBuildDesc {
            performance: desc.performance,
            flags: desc.flags,
            geometry: desc.geometry,
        });

        let accel = self
            .device
            .new_acceleration_structure(AccelerationStructureDesc {
                level: AccelerationStructureLevel::Bottom,
                size: sizes.size,
                name: desc.name,
            })?;

        let serial = self.next_serial;
        self.next_serial += 1;

        let entry = self.entries.vacant_entry();
        let id = BlasId {
            key: entry.key(),
            serial,
        };

        let info = BlasBuildInfo {
            id,
            mode: BuildMode::Build,
            performance: desc.performance,
            flags: desc.flags,
            geometry: desc.geometry.to_vec(),
            sizes,
        };

        self.by_address.insert(accel.address(), id);
        entry.insert(BlasEntry {
            serial,
            name: desc.name.to_owned(),
            accel,
            info: info.clone(),
            state: BlasState::Created,
            compaction_pending: false,
        });

        tracing::debug!(
            "Created BLAS '{}' {:?}: {} bytes, {} scratch",
            desc.name,
            id,
            sizes.size,
            sizes.scratch_size
        );

        Ok((id, info))
    }

    /// Scratch bytes needed to record `infos` as one batch.
    pub fn scratch_requirement(&self, infos: &[BlasBuildInfo], alignment: usize) -> usize {
        scratch_layout(infos.iter().map(BlasBuildInfo::scratch_size), alignment).1
    }

    /// Records builds of `infos` as one batch using scratch from `pool`.
    ///
    /// Grows the pool when needed and returns the scratch size used.
    pub fn build(
        &mut self,
        infos: &[BlasBuildInfo],
        pool: &mut ScratchPool<D>,
        deferred: &mut DeferredDestructionQueue<D>,
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<usize, BuildError> {
        if infos.is_empty() {
            return Ok(0);
        }

        let required = self.scratch_requirement(infos, pool.alignment());
        pool.ensure(required, deferred, encoder.generation())?;

        let scratch = pool.range().ok_or(BuildError::InsufficientScratch {
            required,
            provided: 0,
        })?;

        self.record_builds(infos, scratch, pool.alignment(), encoder)
    }

    /// Records builds of `infos` into `encoder`, carving disjoint
    /// sub-ranges of `scratch` for each one.
    ///
    /// All builds of the batch are separated from earlier and later
    /// work by a single barrier on each side.
    pub fn record_builds(
        &mut self,
        infos: &[BlasBuildInfo],
        scratch: BufferRange<'_, D::Buffer>,
        alignment: usize,
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<usize, BuildError> {
        if infos.is_empty() {
            return Ok(0);
        }

        if scratch.address() % alignment as u64 != 0 {
            return Err(BuildError::MisalignedScratch {
                address: scratch.address(),
                alignment,
            });
        }

        let (offsets, required) =
            scratch_layout(infos.iter().map(BlasBuildInfo::scratch_size), alignment);
        if required > scratch.size {
            return Err(BuildError::InsufficientScratch {
                required,
                provided: scratch.size,
            });
        }

        let mut seen = SmallVec::<[BlasId; 16]>::new();
        for info in infos {
            if seen.contains(&info.id) {
                return Err(BuildError::DuplicateBlas(info.id));
            }
            seen.push(info.id);

            let entry = self.entry(info.id)?;
            if info.mode == BuildMode::Update && entry.state == BlasState::Created {
                return Err(BuildError::UpdateBeforeBuild(info.id));
            }
            // Updates rewrite the structure in place, compacted storage included.
            if info.mode == BuildMode::Build && info.sizes.size > entry.accel.size() {
                return Err(BuildError::StorageTooSmall {
                    id: info.id,
                    required: info.sizes.size,
                    available: entry.accel.size(),
                });
            }
        }

        let generation = encoder.generation();
        let _span = tracing::debug_span!("blas_builds", count = infos.len(), %generation).entered();

        encoder.acceleration_structure_barrier();
        for (info, &offset) in infos.iter().zip(&offsets) {
            let entry = &self.entries[info.id.key];
            let src = match info.mode {
                BuildMode::Build => None,
                BuildMode::Update => Some(&entry.accel),
            };
            encoder.build_blas(
                &entry.accel,
                src,
                info.desc(),
                scratch.slice(offset, info.scratch_size()),
            );
        }
        encoder.acceleration_structure_barrier();

        for info in infos {
            let entry = &mut self.entries[info.id.key];
            entry.state = BlasState::Recorded(generation);
            entry.info.geometry.clone_from(&info.geometry);
            tracing::trace!("Recorded {:?} of BLAS '{}'", info.mode, entry.name);
        }

        Ok(required)
    }

    /// Prepares an in-place update of a built structure.
    ///
    /// The returned info still has to be recorded with [`BlasManager::build`].
    pub fn refit(&self, update: BlasUpdate<'_>) -> Result<BlasBuildInfo, RefitError> {
        let entry = self.entry(update.blas)?;
        let info = &entry.info;

        if !info.flags.contains(AccelerationStructureBuildFlags::ALLOW_UPDATE) {
            return Err(RefitError::UpdateNotAllowed(update.blas));
        }
        if entry.state == BlasState::Created {
            return Err(RefitError::NotBuilt(update.blas));
        }

        let check_count = |found: usize| {
            if found != info.geometry.len() {
                Err(RefitError::GeometryCountMismatch {
                    expected: info.geometry.len(),
                    found,
                })
            } else {
                Ok(())
            }
        };

        let geometry = match update.geometry {
            GeometryUpdate::Unchanged => info.geometry.clone(),
            GeometryUpdate::Addresses(addresses) => {
                check_count(addresses.len())?;
                info.geometry
                    .iter()
                    .zip(addresses)
                    .map(|(geometry, addresses)| geometry.with_addresses(*addresses))
                    .collect()
            }
            GeometryUpdate::Geometry(geometry) => {
                check_count(geometry.len())?;
                for (index, (old, new)) in info.geometry.iter().zip(geometry).enumerate() {
                    if old.primitive_count() != new.primitive_count() {
                        return Err(RefitError::PrimitiveCountMismatch {
                            index,
                            expected: old.primitive_count(),
                            found: new.primitive_count(),
                        });
                    }
                    if !old.same_topology(new) {
                        return Err(RefitError::TopologyMismatch { index });
                    }
                }
                geometry.to_vec()
            }
        };

        Ok(BlasBuildInfo {
            id: update.blas,
            mode: BuildMode::Update,
            performance: info.performance,
            flags: info.flags,
            geometry,
            sizes: info.sizes,
        })
    }

    /// Hands candidates over to the compaction pipeline.
    ///
    /// Structures are not modified until the request is compacted.
    pub fn request_compaction(
        &mut self,
        ids: &[BlasId],
        pipeline: &CompactionPipeline<D>,
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<CompactionRequest<D>, CompactionError> {
        if ids.is_empty() {
            return Err(CompactionError::NoCandidates);
        }

        for (index, &id) in ids.iter().enumerate() {
            if ids[..index].contains(&id) {
                return Err(CompactionError::DuplicateCandidate(id));
            }

            let entry = self.entry(id)?;
            if !entry
                .info
                .flags
                .contains(AccelerationStructureBuildFlags::ALLOW_COMPACTION)
            {
                return Err(CompactionError::CompactionNotAllowed(id));
            }
            if entry.state == BlasState::Created {
                return Err(CompactionError::NotBuilt(id));
            }
            if entry.compaction_pending {
                return Err(CompactionError::AlreadyPending(id));
            }
        }

        let structures: SmallVec<[&D::AccelerationStructure; 16]> = ids
            .iter()
            .map(|id| &self.entries[id.key].accel)
            .collect();
        let original_sizes = structures.iter().map(|accel| accel.size()).collect();

        let request = pipeline.issue(ids.to_vec(), original_sizes, &structures, encoder)?;
        drop(structures);

        for id in ids {
            self.entries[id.key].compaction_pending = true;
        }
        Ok(request)
    }

    /// Replaces live structure of `id` with `accel`.
    ///
    /// The superseded structure is deferred to `generation`.
    /// Returns address and size of the superseded structure.
    pub(crate) fn replace(
        &mut self,
        id: BlasId,
        accel: D::AccelerationStructure,
        deferred: &mut DeferredDestructionQueue<D>,
        generation: Generation,
    ) -> Result<(DeviceAddress, usize), UnknownBlas> {
        let entry = self.entry_mut(id)?;
        let old = std::mem::replace(&mut entry.accel, accel);
        entry.state = BlasState::Recorded(generation);
        entry.compaction_pending = false;

        let new_address = entry.accel.address();
        let retired = (old.address(), old.size());

        self.by_address.remove(&retired.0);
        self.by_address.insert(new_address, id);
        deferred.defer_acceleration_structure(generation, old);

        Ok(retired)
    }

    /// Forgets pending compaction of `id`, if the structure still exists.
    pub(crate) fn clear_compaction(&mut self, id: BlasId) {
        if let Ok(entry) = self.entry_mut(id) {
            entry.compaction_pending = false;
        }
    }

    /// Destroys structure once `generation` completes.
    pub fn destroy(
        &mut self,
        id: BlasId,
        deferred: &mut DeferredDestructionQueue<D>,
        generation: Generation,
    ) -> Result<(), UnknownBlas> {
        self.entry(id)?;
        let entry = self.entries.remove(id.key);
        self.by_address.remove(&entry.accel.address());
        tracing::debug!("Destroying BLAS '{}' {:?}", entry.name, id);
        deferred.defer_acceleration_structure(generation, entry.accel);
        Ok(())
    }

    /// Destroys every structure once `generation` completes.
    pub fn destroy_all(&mut self, deferred: &mut DeferredDestructionQueue<D>, generation: Generation) {
        self.by_address.clear();
        for entry in self.entries.drain() {
            deferred.defer_acceleration_structure(generation, entry.accel);
        }
    }

    /// Marks writes recorded up to `completed` as finished.
    pub fn observe_completed(&mut self, completed: Generation) {
        for (_, entry) in self.entries.iter_mut() {
            if let BlasState::Recorded(generation) = entry.state {
                if generation <= completed {
                    entry.state = BlasState::Built;
                }
            }
        }
    }

    pub fn state(&self, id: BlasId) -> Result<BlasState, UnknownBlas> {
        Ok(self.entry(id)?.state)
    }

    /// Address instances must use to reference the structure.
    pub fn address(&self, id: BlasId) -> Result<DeviceAddress, UnknownBlas> {
        Ok(self.entry(id)?.accel.address())
    }

    /// Size of the current storage in bytes.
    pub fn size(&self, id: BlasId) -> Result<usize, UnknownBlas> {
        Ok(self.entry(id)?.accel.size())
    }

    /// Last recorded build info.
    pub fn build_info(&self, id: BlasId) -> Result<&BlasBuildInfo, UnknownBlas> {
        Ok(&self.entry(id)?.info)
    }

    pub fn is_compaction_pending(&self, id: BlasId) -> Result<bool, UnknownBlas> {
        Ok(self.entry(id)?.compaction_pending)
    }

    pub(crate) fn accel(&self, id: BlasId) -> Result<&D::AccelerationStructure, UnknownBlas> {
        Ok(&self.entry(id)?.accel)
    }

    /// Resolves an instance reference to the live structure it points at.
    pub fn lookup(&self, address: DeviceAddress) -> Option<BlasId> {
        self.by_address.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = BlasId> + '_ {
        self.entries.iter().map(|(key, entry)| BlasId {
            key,
            serial: entry.serial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        generic::{BlasTriangles, VertexFormat},
        headless::{HeadlessDevice, ValidationError},
        traits::Buffer,
    };

    fn triangle(vertices: DeviceAddress, primitive_count: u32) -> BlasGeometryDesc {
        BlasGeometryDesc::Triangles(BlasTriangles {
            opaque: true,
            vertex_format: VertexFormat::Float32x3,
            vertex_stride: 12,
            max_vertex: primitive_count * 3 - 1,
            vertices,
            indices: None,
            transform: None,
            primitive_count,
        })
    }

    struct Fixture {
        device: HeadlessDevice,
        manager: BlasManager<HeadlessDevice>,
        pool: ScratchPool<HeadlessDevice>,
        deferred: DeferredDestructionQueue<HeadlessDevice>,
        vertices: <HeadlessDevice as Device>::Buffer,
    }

    impl Fixture {
        fn new() -> Self {
            let device = HeadlessDevice::default();
            let vertices = device.new_geometry_buffer(4096).unwrap();
            Fixture {
                manager: BlasManager::new(device.clone()),
                pool: ScratchPool::new(device.clone(), "blas-scratch"),
                deferred: DeferredDestructionQueue::new(device.clone()),
                vertices,
                device,
            }
        }

        fn create(
            &mut self,
            primitive_count: u32,
            flags: AccelerationStructureBuildFlags,
        ) -> (BlasId, BlasBuildInfo) {
            let geometry = [triangle(self.vertices.address(), primitive_count)];
            self.manager
                .create(BlasDesc {
                    geometry: &geometry,
                    flags,
                    performance: AccelerationStructurePerformance::FastTrace,
                    name: "test",
                })
                .unwrap()
        }

        fn build(&mut self, infos: &[BlasBuildInfo]) -> Generation {
            let mut encoder = self.device.new_encoder();
            self.manager
                .build(infos, &mut self.pool, &mut self.deferred, &mut encoder)
                .unwrap();
            let generation = encoder.generation();
            self.device.submit(encoder);
            self.device.complete(generation);
            self.manager.observe_completed(generation);
            generation
        }
    }

    #[test]
    fn create_does_not_build() {
        let mut fixture = Fixture::new();
        let (id, info) = fixture.create(1, AccelerationStructureBuildFlags::empty());

        assert_eq!(fixture.manager.state(id).unwrap(), BlasState::Created);
        assert_eq!(info.mode(), BuildMode::Build);
        assert!(fixture.manager.size(id).unwrap() >= info.sizes().size);
        assert_eq!(fixture.device.submitted_commands(), 0);
    }

    #[test]
    fn batched_build_shares_scratch_and_barriers() {
        let mut fixture = Fixture::new();
        let infos: Vec<_> = (1..=3)
            .map(|count| fixture.create(count, AccelerationStructureBuildFlags::empty()).1)
            .collect();

        let mut encoder = fixture.device.new_encoder();
        let used = fixture
            .manager
            .build(&infos, &mut fixture.pool, &mut fixture.deferred, &mut encoder)
            .unwrap();
        assert_eq!(
            used,
            fixture.manager.scratch_requirement(&infos, fixture.pool.alignment())
        );
        assert!(fixture.pool.capacity() >= used);
        assert_eq!(encoder.barrier_count(), 2);

        let generation = encoder.generation();
        fixture.device.submit(encoder);
        fixture.device.complete(generation);
        fixture.manager.observe_completed(generation);

        for info in &infos {
            assert_eq!(fixture.manager.state(info.id()).unwrap(), BlasState::Built);
        }
        assert!(fixture.device.take_validation_errors().is_empty());
    }

    #[test]
    fn undersized_scratch_is_rejected() {
        let mut fixture = Fixture::new();
        let (_, info) = fixture.create(8, AccelerationStructureBuildFlags::empty());

        let small = fixture.device.new_scratch_buffer(256).unwrap();
        let mut encoder = fixture.device.new_encoder();
        let err = fixture
            .manager
            .record_builds(
                &[info.clone()],
                BufferRange::whole(&small),
                fixture.pool.alignment(),
                &mut encoder,
            )
            .unwrap_err();

        assert!(matches!(
            err,
            BuildError::InsufficientScratch { provided: 256, required } if required == info.scratch_size()
        ));
        assert_eq!(encoder.command_count(), 0);
    }

    #[test]
    fn misaligned_scratch_is_rejected() {
        let mut fixture = Fixture::new();
        let (_, info) = fixture.create(2, AccelerationStructureBuildFlags::empty());

        let scratch = fixture
            .device
            .new_scratch_buffer(info.scratch_size() + 64)
            .unwrap();
        let range = BufferRange {
            buffer: &scratch,
            offset: 16,
            size: info.scratch_size(),
        };

        let mut encoder = fixture.device.new_encoder();
        let err = fixture
            .manager
            .record_builds(&[info], range, fixture.pool.alignment(), &mut encoder)
            .unwrap_err();
        assert!(matches!(err, BuildError::MisalignedScratch { .. }));
        assert_eq!(encoder.command_count(), 0);
    }

    #[test]
    fn duplicate_in_batch_is_rejected() {
        let mut fixture = Fixture::new();
        let (id, info) = fixture.create(1, AccelerationStructureBuildFlags::empty());

        let mut encoder = fixture.device.new_encoder();
        let err = fixture
            .manager
            .build(
                &[info.clone(), info],
                &mut fixture.pool,
                &mut fixture.deferred,
                &mut encoder,
            )
            .unwrap_err();
        assert!(matches!(err, BuildError::DuplicateBlas(dup) if dup == id));
    }

    #[test]
    fn refit_keeps_structure_size() {
        let mut fixture = Fixture::new();
        let (id, info) = fixture.create(4, AccelerationStructureBuildFlags::ALLOW_UPDATE);
        fixture.build(&[info.clone()]);
        let size = fixture.manager.size(id).unwrap();

        let moved = fixture.device.new_geometry_buffer(4096).unwrap();
        let addresses = [GeometryAddresses {
            data: moved.address(),
            indices: None,
            transform: None,
        }];
        let update = fixture
            .manager
            .refit(BlasUpdate {
                blas: id,
                geometry: GeometryUpdate::Addresses(&addresses),
            })
            .unwrap();

        assert_eq!(update.mode(), BuildMode::Update);
        assert_eq!(update.sizes(), info.sizes());
        assert_eq!(update.scratch_size(), info.sizes().update_scratch_size);
        assert_eq!(update.geometry()[0].addresses().data, addresses[0].data);

        fixture.build(&[update]);
        assert_eq!(fixture.manager.size(id).unwrap(), size);
        assert!(fixture.device.take_validation_errors().is_empty());
    }

    #[test]
    fn refit_without_allow_update_fails() {
        let mut fixture = Fixture::new();
        for flags in [
            AccelerationStructureBuildFlags::empty(),
            AccelerationStructureBuildFlags::ALLOW_COMPACTION,
        ] {
            let (id, info) = fixture.create(1, flags);
            fixture.build(&[info]);

            let err = fixture
                .manager
                .refit(BlasUpdate {
                    blas: id,
                    geometry: GeometryUpdate::Unchanged,
                })
                .unwrap_err();
            assert!(matches!(err, RefitError::UpdateNotAllowed(failed) if failed == id));
        }
    }

    #[test]
    fn refit_with_mismatched_counts_fails() {
        let mut fixture = Fixture::new();
        let (id, info) = fixture.create(2, AccelerationStructureBuildFlags::ALLOW_UPDATE);
        fixture.build(&[info]);

        let vertices = fixture.vertices.address();
        let err = fixture
            .manager
            .refit(BlasUpdate {
                blas: id,
                geometry: GeometryUpdate::Geometry(&[triangle(vertices, 3)]),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            RefitError::PrimitiveCountMismatch {
                index: 0,
                expected: 2,
                found: 3
            }
        ));

        let err = fixture
            .manager
            .refit(BlasUpdate {
                blas: id,
                geometry: GeometryUpdate::Geometry(&[triangle(vertices, 2), triangle(vertices, 2)]),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            RefitError::GeometryCountMismatch {
                expected: 1,
                found: 2
            }
        ));

        let err = fixture
            .manager
            .refit(BlasUpdate {
                blas: id,
                geometry: GeometryUpdate::Addresses(&[]),
            })
            .unwrap_err();
        assert!(matches!(err, RefitError::GeometryCountMismatch { .. }));
    }

    #[test]
    fn refit_before_build_fails() {
        let mut fixture = Fixture::new();
        let (id, _) = fixture.create(1, AccelerationStructureBuildFlags::ALLOW_UPDATE);
        let err = fixture
            .manager
            .refit(BlasUpdate {
                blas: id,
                geometry: GeometryUpdate::Unchanged,
            })
            .unwrap_err();
        assert!(matches!(err, RefitError::NotBuilt(_)));
    }

    #[test]
    fn destroyed_handle_is_unknown() {
        let mut fixture = Fixture::new();
        let (id, info) = fixture.create(1, AccelerationStructureBuildFlags::empty());
        let generation = fixture.build(&[info]);
        let address = fixture.manager.address(id).unwrap();

        fixture
            .manager
            .destroy(id, &mut fixture.deferred, generation.next())
            .unwrap();
        assert_eq!(fixture.manager.address(id), Err(UnknownBlas(id)));
        assert_eq!(fixture.manager.lookup(address), None);

        // Slot is reused by the next structure, the old handle stays dead.
        let (reused, _) = fixture.create(1, AccelerationStructureBuildFlags::empty());
        assert_ne!(reused, id);
        assert!(fixture.manager.state(id).is_err());

        fixture.deferred.retire(generation.next());
        fixture.manager.destroy_all(&mut fixture.deferred, generation.next().next());
        fixture.deferred.destroy_all_idle();
        assert!(fixture.device.take_validation_errors().is_empty());
    }

    #[test]
    fn freeing_before_completion_is_caught() {
        let mut fixture = Fixture::new();
        let (id, info) = fixture.create(1, AccelerationStructureBuildFlags::empty());

        let mut encoder = fixture.device.new_encoder();
        fixture
            .manager
            .build(&[info], &mut fixture.pool, &mut fixture.deferred, &mut encoder)
            .unwrap();
        let generation = encoder.generation();
        fixture.device.submit(encoder);

        // Retiring with a generation that is already "complete" frees the
        // structure while the build is still in flight.
        fixture.manager.destroy(id, &mut fixture.deferred, generation).unwrap();
        fixture.deferred.retire(generation);
        fixture.device.complete(generation);

        let errors = fixture.device.take_validation_errors();
        assert!(errors
            .iter()
            .any(|err| matches!(err, ValidationError::UseAfterFree { .. })));
    }
}
