use crate::{
    blas::{BlasId, BlasManager},
    deferred::DeferredDestructionQueue,
    error::CompactionError,
    generic::{AccelerationStructureDesc, AccelerationStructureLevel, DeviceAddress, Generation},
    traits::{AccelerationStructure, CommandEncoder, Device},
};

/// Lifecycle of a compaction request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompactionState {
    /// Size query issued, sizes unknown.
    Pending,

    /// Compacted sizes are known.
    SizesReady,

    /// Compacting copies recorded, compacted structures are not installed yet.
    Compacting { generation: Generation },

    /// Compacted structures are live.
    /// Originals are kept until `generation` completes.
    Compacted { generation: Generation },

    /// Originals are released.
    OriginalsRetired,
}

/// Candidates submitted for compaction and their size queries.
///
/// Requests that are dropped before reaching `Compacted` leak
/// their query pool; use [`CompactionPipeline::abandon`].
pub struct CompactionRequest<D: Device> {
    candidates: Vec<BlasId>,
    original_sizes: Vec<usize>,
    issued: Generation,
    queries: Option<D::QueryPool>,
    last_polled: Option<Generation>,
    sizes: Vec<usize>,
    state: CompactionState,
}

impl<D> CompactionRequest<D>
where
    D: Device,
{
    pub fn state(&self) -> CompactionState {
        self.state
    }

    pub fn candidates(&self) -> &[BlasId] {
        &self.candidates
    }

    /// Sizes of candidates when the request was issued.
    pub fn original_sizes(&self) -> &[usize] {
        &self.original_sizes
    }

    /// Compacted sizes. Empty until the query completes.
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Generation of the command list that wrote the size query.
    pub fn issued(&self) -> Generation {
        self.issued
    }

    fn require(&self, expected: &'static str, ok: bool) -> Result<(), CompactionError> {
        if ok {
            Ok(())
        } else {
            Err(CompactionError::InvalidState {
                expected,
                found: self.state,
            })
        }
    }
}

/// Candidate after compaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompactedBlas {
    pub blas: BlasId,

    /// Address of the superseded original.
    /// Instances still pointing here are stale.
    pub retired_address: DeviceAddress,
    pub retired_size: usize,

    pub address: DeviceAddress,
    pub size: usize,
}

/// Compacted copy that is not yet installed into the manager.
///
/// Must end in [`CompactionPipeline::install`] or
/// [`CompactionPipeline::discard`], dropping it leaks the structure.
#[derive(Debug)]
#[must_use = "detached compactions must be installed or discarded"]
pub struct DetachedCompaction<D: Device> {
    blas: BlasId,
    accel: D::AccelerationStructure,
}

impl<D> DetachedCompaction<D>
where
    D: Device,
{
    pub fn blas(&self) -> BlasId {
        self.blas
    }

    pub fn address(&self) -> DeviceAddress {
        self.accel.address()
    }

    pub fn size(&self) -> usize {
        self.accel.size()
    }
}

/// Shrinks bottom-level structures to their post-build size.
///
/// Sizes come from a device query that completes an unknown number
/// of frames after the build. Requests are polled once per frame and
/// never block.
pub struct CompactionPipeline<D: Device> {
    device: D,
}

impl<D> CompactionPipeline<D>
where
    D: Device,
{
    pub fn new(device: D) -> Self {
        CompactionPipeline { device }
    }

    /// Records size query for `structures`.
    ///
    /// Structures must have their builds recorded before this point.
    pub(crate) fn issue(
        &self,
        candidates: Vec<BlasId>,
        original_sizes: Vec<usize>,
        structures: &[&D::AccelerationStructure],
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<CompactionRequest<D>, CompactionError> {
        debug_assert_eq!(candidates.len(), structures.len());

        let queries = self
            .device
            .new_compacted_size_queries(structures.len() as u32)?;

        encoder.acceleration_structure_barrier();
        encoder.write_compacted_sizes(structures, &queries);

        let issued = encoder.generation();
        tracing::debug!(
            "Compaction of {} BLAS requested at generation {}",
            candidates.len(),
            issued
        );

        Ok(CompactionRequest {
            candidates,
            original_sizes,
            issued,
            queries: Some(queries),
            last_polled: None,
            sizes: Vec::new(),
            state: CompactionState::Pending,
        })
    }

    /// Returns compacted sizes, one per candidate, or nothing if
    /// the query is not complete yet.
    ///
    /// Must be called at most once per frame, `generation` identifies the frame.
    pub fn get_sizes(
        &self,
        request: &mut CompactionRequest<D>,
        generation: Generation,
    ) -> Result<Vec<usize>, CompactionError> {
        if request.last_polled == Some(generation) {
            return Err(CompactionError::PolledTwice);
        }

        match request.state {
            CompactionState::Pending => {}
            CompactionState::SizesReady => {
                request.last_polled = Some(generation);
                return Ok(request.sizes.clone());
            }
            _ => request.require("pending or sizes ready", false)?,
        }

        let Some(queries) = &request.queries else {
            return request
                .require("query pool", false)
                .map(|()| Vec::new());
        };

        let count = request.candidates.len() as u32;
        let sizes = match self.device.compacted_sizes(queries, count)? {
            None => {
                request.last_polled = Some(generation);
                return Ok(Vec::new());
            }
            Some(sizes) => sizes,
        };

        if sizes.len() != request.candidates.len() {
            return Err(CompactionError::SizeCountMismatch {
                expected: request.candidates.len(),
                found: sizes.len(),
            });
        }

        // Results are available only after the query command completed.
        if let Some(queries) = request.queries.take() {
            self.device.destroy_query_pool(queries);
        }

        tracing::debug!(
            "Compaction sizes ready after {} generations: {:?} -> {:?}",
            generation.get().saturating_sub(request.issued.get()),
            request.original_sizes,
            sizes
        );

        request.last_polled = Some(generation);
        request.sizes = sizes;
        request.state = CompactionState::SizesReady;
        Ok(request.sizes.clone())
    }

    /// Polls the request. Returns `true` once sizes are known.
    pub fn poll(
        &self,
        request: &mut CompactionRequest<D>,
        generation: Generation,
    ) -> Result<bool, CompactionError> {
        Ok(!self.get_sizes(request, generation)?.is_empty())
    }

    /// Allocates compacted structures and records copies into them.
    ///
    /// Candidates that were destroyed meanwhile, or that would not shrink,
    /// are dropped from the result.
    fn record_copies(
        &self,
        request: &CompactionRequest<D>,
        blas: &mut BlasManager<D>,
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<Vec<DetachedCompaction<D>>, CompactionError> {
        request.require("sizes ready", request.state == CompactionState::SizesReady)?;

        let mut compacted: Vec<DetachedCompaction<D>> = Vec::new();
        for (&id, &size) in request.candidates.iter().zip(&request.sizes) {
            let current = match blas.size(id) {
                Ok(current) => current,
                Err(_) => {
                    tracing::warn!("Compaction candidate {id:?} was destroyed before compaction");
                    continue;
                }
            };

            if size >= current {
                tracing::debug!(
                    "Compaction candidate {id:?} skipped, {size} bytes is not smaller than {current}"
                );
                blas.clear_compaction(id);
                continue;
            }

            let accel = self
                .device
                .new_acceleration_structure(AccelerationStructureDesc {
                    level: AccelerationStructureLevel::Bottom,
                    size,
                    name: "compacted",
                });

            match accel {
                Ok(accel) => compacted.push(DetachedCompaction { blas: id, accel }),
                Err(err) => {
                    // Nothing references them yet.
                    for unused in compacted {
                        self.device.destroy_acceleration_structure(unused.accel);
                    }
                    return Err(err.into());
                }
            }
        }

        if compacted.is_empty() {
            return Ok(compacted);
        }

        encoder.acceleration_structure_barrier();
        for copy in &compacted {
            let src = blas.accel(copy.blas)?;
            encoder.copy_compacted(src, &copy.accel);
        }
        encoder.acceleration_structure_barrier();

        Ok(compacted)
    }

    /// Records compacting copies and swaps compacted structures
    /// into `blas` right away.
    ///
    /// Superseded originals go to `deferred` with the encoder's generation.
    /// Live addresses change, top-level structures must be rebuilt
    /// with the new addresses before the originals are freed.
    pub fn compact_in_place(
        &self,
        request: &mut CompactionRequest<D>,
        blas: &mut BlasManager<D>,
        deferred: &mut DeferredDestructionQueue<D>,
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<Vec<CompactedBlas>, CompactionError> {
        let compacted = self.record_copies(request, blas, encoder)?;
        let generation = encoder.generation();

        let mut result = Vec::with_capacity(compacted.len());
        for copy in compacted {
            let address = copy.accel.address();
            let size = copy.accel.size();
            let (retired_address, retired_size) =
                blas.replace(copy.blas, copy.accel, deferred, generation)?;
            result.push(CompactedBlas {
                blas: copy.blas,
                retired_address,
                retired_size,
                address,
                size,
            });
        }

        tracing::debug!("Compacted {} BLAS at generation {generation}", result.len());
        request.state = CompactionState::Compacted { generation };
        Ok(result)
    }

    /// Records compacting copies and returns compacted structures
    /// without touching live ones.
    ///
    /// Caller installs them with [`CompactionPipeline::install`]
    /// once it is ready to switch references.
    pub fn compact_detached(
        &self,
        request: &mut CompactionRequest<D>,
        blas: &mut BlasManager<D>,
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<Vec<DetachedCompaction<D>>, CompactionError> {
        let compacted = self.record_copies(request, blas, encoder)?;
        let generation = encoder.generation();
        tracing::debug!("Compacting copies of {} BLAS recorded at {generation}", compacted.len());
        request.state = CompactionState::Compacting { generation };
        Ok(compacted)
    }

    /// Installs compacted structures produced by
    /// [`CompactionPipeline::compact_detached`].
    ///
    /// Originals are deferred to `generation`, which must be the
    /// generation of the last command list that may reference them.
    pub fn install(
        &self,
        request: &mut CompactionRequest<D>,
        compacted: Vec<DetachedCompaction<D>>,
        blas: &mut BlasManager<D>,
        deferred: &mut DeferredDestructionQueue<D>,
        generation: Generation,
    ) -> Result<Vec<CompactedBlas>, CompactionError> {
        let CompactionState::Compacting { generation: copied } = request.state else {
            return Err(CompactionError::InvalidState {
                expected: "compacting",
                found: request.state,
            });
        };

        if compacted
            .iter()
            .any(|copy| !request.candidates.contains(&copy.blas))
        {
            return Err(CompactionError::ForeignCompaction);
        }

        let generation = generation.max(copied);
        let mut result = Vec::with_capacity(compacted.len());
        for copy in compacted {
            let address = copy.accel.address();
            let size = copy.accel.size();
            let id = copy.blas;

            if blas.size(id).is_err() {
                tracing::warn!("Compacted {id:?} was destroyed before install");
                deferred.defer_acceleration_structure(generation, copy.accel);
                continue;
            }

            let (retired_address, retired_size) = blas.replace(id, copy.accel, deferred, generation)?;
            result.push(CompactedBlas {
                blas: id,
                retired_address,
                retired_size,
                address,
                size,
            });
        }

        request.state = CompactionState::Compacted { generation };
        Ok(result)
    }

    /// Throws away compacted copies produced by
    /// [`CompactionPipeline::compact_detached`], keeping the originals live.
    ///
    /// Copies are deferred to `generation`, or the copy generation if later.
    pub fn discard(
        &self,
        request: CompactionRequest<D>,
        compacted: Vec<DetachedCompaction<D>>,
        blas: &mut BlasManager<D>,
        deferred: &mut DeferredDestructionQueue<D>,
        generation: Generation,
    ) {
        let generation = match request.state {
            CompactionState::Compacting { generation: copied } => generation.max(copied),
            _ => generation,
        };

        tracing::debug!("Discarding {} detached compactions", compacted.len());
        for copy in compacted {
            deferred.defer_acceleration_structure(generation, copy.accel);
        }
        for &id in &request.candidates {
            blas.clear_compaction(id);
        }
        self.abandon(request, blas, deferred, generation);
    }

    /// Moves request to `OriginalsRetired` once `completed` covers
    /// the generation originals were deferred to.
    ///
    /// Returns `true` if request reached its final state.
    pub fn observe_completed(&self, request: &mut CompactionRequest<D>, completed: Generation) -> bool {
        match request.state {
            CompactionState::Compacted { generation } if generation <= completed => {
                tracing::debug!("Compaction originals retired at {completed}");
                request.state = CompactionState::OriginalsRetired;
                true
            }
            CompactionState::OriginalsRetired => true,
            _ => false,
        }
    }

    /// Drops the request, releasing its query pool once `generation` completes.
    pub fn abandon(
        &self,
        mut request: CompactionRequest<D>,
        blas: &mut BlasManager<D>,
        deferred: &mut DeferredDestructionQueue<D>,
        generation: Generation,
    ) {
        if let Some(queries) = request.queries.take() {
            deferred.defer_query_pool(generation, queries);
        }
        if matches!(
            request.state,
            CompactionState::Pending | CompactionState::SizesReady
        ) {
            for &id in &request.candidates {
                blas.clear_compaction(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blas::{BlasDesc, BlasState, BlasUpdate, GeometryUpdate},
        generic::{
            AccelerationStructureBuildFlags, AccelerationStructurePerformance, BlasGeometryDesc,
            BlasTriangles, VertexFormat,
        },
        headless::{HeadlessDevice, HeadlessEncoder},
        scratch::ScratchPool,
        traits::Buffer,
    };

    struct Fixture {
        device: HeadlessDevice,
        blas: BlasManager<HeadlessDevice>,
        pipeline: CompactionPipeline<HeadlessDevice>,
        pool: ScratchPool<HeadlessDevice>,
        deferred: DeferredDestructionQueue<HeadlessDevice>,
        vertices: DeviceAddress,
    }

    impl Fixture {
        fn new(query_latency: u64) -> Self {
            let device = HeadlessDevice::with_query_latency(query_latency);
            let vertices = device.new_geometry_buffer(1024).unwrap().address();
            Fixture {
                blas: BlasManager::new(device.clone()),
                pipeline: CompactionPipeline::new(device.clone()),
                pool: ScratchPool::new(device.clone(), "scratch"),
                deferred: DeferredDestructionQueue::new(device.clone()),
                vertices,
                device,
            }
        }

        fn triangle(&mut self, flags: AccelerationStructureBuildFlags) -> BlasId {
            let geometry = [BlasGeometryDesc::Triangles(BlasTriangles {
                opaque: true,
                vertex_format: VertexFormat::Float32x3,
                vertex_stride: 12,
                max_vertex: 2,
                vertices: self.vertices,
                indices: None,
                transform: None,
                primitive_count: 1,
            })];

            let (id, info) = self
                .blas
                .create(BlasDesc {
                    geometry: &geometry,
                    flags,
                    performance: AccelerationStructurePerformance::FastTrace,
                    name: "triangle",
                })
                .unwrap();

            let mut encoder = self.device.new_encoder();
            self.blas
                .build(&[info], &mut self.pool, &mut self.deferred, &mut encoder)
                .unwrap();
            self.finish(encoder);
            id
        }

        fn finish(&mut self, encoder: HeadlessEncoder) -> Generation {
            let generation = encoder.generation();
            self.device.submit(encoder);
            self.device.complete(generation);
            self.blas.observe_completed(generation);
            self.deferred.retire(generation);
            generation
        }

        /// Polls once per simulated frame until sizes are ready.
        fn poll_until_ready(&mut self, request: &mut CompactionRequest<HeadlessDevice>) -> usize {
            for frame in 0..16 {
                let encoder = self.device.new_encoder();
                let ready = self.pipeline.poll(request, encoder.generation()).unwrap();
                self.finish(encoder);
                if ready {
                    return frame;
                }
            }
            panic!("compaction sizes never became ready");
        }
    }

    #[test]
    fn compaction_round_trip() {
        let mut fixture = Fixture::new(2);
        let id = fixture.triangle(AccelerationStructureBuildFlags::ALLOW_COMPACTION);
        let original_address = fixture.blas.address(id).unwrap();
        let original_size = fixture.blas.size(id).unwrap();

        let mut encoder = fixture.device.new_encoder();
        let mut request = fixture
            .blas
            .request_compaction(&[id], &fixture.pipeline, &mut encoder)
            .unwrap();
        assert_eq!(request.state(), CompactionState::Pending);
        assert!(fixture.blas.is_compaction_pending(id).unwrap());

        // Not ready within the frame that issued the query.
        assert!(!fixture.pipeline.poll(&mut request, encoder.generation()).unwrap());
        fixture.finish(encoder);

        let frames = fixture.poll_until_ready(&mut request);
        assert!(frames > 0);
        assert_eq!(request.state(), CompactionState::SizesReady);
        assert_eq!(request.sizes().len(), 1);

        let mut encoder = fixture.device.new_encoder();
        let compacted = fixture
            .pipeline
            .compact_in_place(&mut request, &mut fixture.blas, &mut fixture.deferred, &mut encoder)
            .unwrap();
        let copy_generation = encoder.generation();

        assert_eq!(compacted.len(), 1);
        let compacted = compacted[0];
        assert_eq!(compacted.blas, id);
        assert_eq!(compacted.retired_address, original_address);
        assert_ne!(compacted.retired_address, fixture.blas.address(id).unwrap());
        assert!(fixture.blas.size(id).unwrap() <= original_size);
        assert_eq!(fixture.blas.lookup(original_address), None);
        assert_eq!(fixture.blas.lookup(compacted.address), Some(id));
        assert!(!fixture.blas.is_compaction_pending(id).unwrap());
        assert_eq!(
            request.state(),
            CompactionState::Compacted {
                generation: copy_generation
            }
        );

        // Original survives until the copy completes.
        assert!(!fixture.pipeline.observe_completed(&mut request, copy_generation.saturating_sub(1)));
        assert_eq!(fixture.device.live_acceleration_structures(), 2);

        fixture.finish(encoder);
        assert!(fixture.pipeline.observe_completed(&mut request, copy_generation));
        assert_eq!(request.state(), CompactionState::OriginalsRetired);
        assert_eq!(fixture.device.live_acceleration_structures(), 1);
        assert_eq!(fixture.blas.state(id).unwrap(), BlasState::Built);
        assert!(fixture.device.take_validation_errors().is_empty());
    }

    #[test]
    fn polling_twice_per_frame_fails() {
        let mut fixture = Fixture::new(1);
        let id = fixture.triangle(AccelerationStructureBuildFlags::ALLOW_COMPACTION);

        let mut encoder = fixture.device.new_encoder();
        let mut request = fixture
            .blas
            .request_compaction(&[id], &fixture.pipeline, &mut encoder)
            .unwrap();
        fixture.finish(encoder);

        let encoder = fixture.device.new_encoder();
        let generation = encoder.generation();
        fixture.pipeline.get_sizes(&mut request, generation).unwrap();
        assert!(matches!(
            fixture.pipeline.get_sizes(&mut request, generation),
            Err(CompactionError::PolledTwice)
        ));
        fixture.finish(encoder);
        fixture
            .pipeline
            .abandon(request, &mut fixture.blas, &mut fixture.deferred, generation.next());
    }

    #[test]
    fn request_validates_candidates() {
        let mut fixture = Fixture::new(0);
        let plain = fixture.triangle(AccelerationStructureBuildFlags::empty());
        let compactable = fixture.triangle(AccelerationStructureBuildFlags::ALLOW_COMPACTION);

        let mut encoder = fixture.device.new_encoder();
        assert!(matches!(
            fixture.blas.request_compaction(&[plain], &fixture.pipeline, &mut encoder),
            Err(CompactionError::CompactionNotAllowed(id)) if id == plain
        ));
        assert!(matches!(
            fixture.blas.request_compaction(&[], &fixture.pipeline, &mut encoder),
            Err(CompactionError::NoCandidates)
        ));
        assert!(matches!(
            fixture
                .blas
                .request_compaction(&[compactable, compactable], &fixture.pipeline, &mut encoder),
            Err(CompactionError::DuplicateCandidate(_))
        ));

        let request = fixture
            .blas
            .request_compaction(&[compactable], &fixture.pipeline, &mut encoder)
            .unwrap();
        assert!(matches!(
            fixture.blas.request_compaction(&[compactable], &fixture.pipeline, &mut encoder),
            Err(CompactionError::AlreadyPending(_))
        ));

        let generation = fixture.finish(encoder);
        fixture
            .pipeline
            .abandon(request, &mut fixture.blas, &mut fixture.deferred, generation.next());
        assert!(!fixture.blas.is_compaction_pending(compactable).unwrap());
    }

    #[test]
    fn compacting_before_sizes_are_ready_fails() {
        let mut fixture = Fixture::new(4);
        let id = fixture.triangle(AccelerationStructureBuildFlags::ALLOW_COMPACTION);

        let mut encoder = fixture.device.new_encoder();
        let mut request = fixture
            .blas
            .request_compaction(&[id], &fixture.pipeline, &mut encoder)
            .unwrap();

        let err = fixture
            .pipeline
            .compact_in_place(&mut request, &mut fixture.blas, &mut fixture.deferred, &mut encoder)
            .unwrap_err();
        assert!(matches!(
            err,
            CompactionError::InvalidState {
                found: CompactionState::Pending,
                ..
            }
        ));
        let generation = fixture.finish(encoder);
        fixture
            .pipeline
            .abandon(request, &mut fixture.blas, &mut fixture.deferred, generation.next());
    }

    #[test]
    fn detached_compaction_installs_later() {
        let mut fixture = Fixture::new(0);
        let id = fixture.triangle(AccelerationStructureBuildFlags::ALLOW_COMPACTION);
        let original_address = fixture.blas.address(id).unwrap();

        let mut encoder = fixture.device.new_encoder();
        let mut request = fixture
            .blas
            .request_compaction(&[id], &fixture.pipeline, &mut encoder)
            .unwrap();
        fixture.finish(encoder);
        fixture.poll_until_ready(&mut request);

        let mut encoder = fixture.device.new_encoder();
        let detached = fixture
            .pipeline
            .compact_detached(&mut request, &mut fixture.blas, &mut encoder)
            .unwrap();
        let copied = fixture.finish(encoder);

        assert!(matches!(request.state(), CompactionState::Compacting { .. }));
        assert_eq!(detached.len(), 1);
        assert_ne!(detached[0].address(), original_address);

        // Live handle is untouched until install.
        assert_eq!(fixture.blas.address(id).unwrap(), original_address);

        let install_generation = copied.next();
        let installed = fixture
            .pipeline
            .install(
                &mut request,
                detached,
                &mut fixture.blas,
                &mut fixture.deferred,
                install_generation,
            )
            .unwrap();
        assert_eq!(installed[0].retired_address, original_address);
        assert_eq!(fixture.blas.address(id).unwrap(), installed[0].address);
        assert_eq!(
            request.state(),
            CompactionState::Compacted {
                generation: install_generation
            }
        );

        fixture.deferred.retire(install_generation);
        assert!(fixture.pipeline.observe_completed(&mut request, install_generation));
        assert_eq!(fixture.device.live_acceleration_structures(), 1);
    }

    #[test]
    fn destroyed_candidate_is_dropped() {
        let mut fixture = Fixture::new(1);
        let kept = fixture.triangle(AccelerationStructureBuildFlags::ALLOW_COMPACTION);
        let gone = fixture.triangle(AccelerationStructureBuildFlags::ALLOW_COMPACTION);

        let mut encoder = fixture.device.new_encoder();
        let mut request = fixture
            .blas
            .request_compaction(&[kept, gone], &fixture.pipeline, &mut encoder)
            .unwrap();
        fixture.finish(encoder);

        let encoder = fixture.device.new_encoder();
        fixture
            .blas
            .destroy(gone, &mut fixture.deferred, encoder.generation())
            .unwrap();
        fixture.finish(encoder);

        fixture.poll_until_ready(&mut request);
        assert_eq!(request.sizes().len(), 2);

        let mut encoder = fixture.device.new_encoder();
        let compacted = fixture
            .pipeline
            .compact_in_place(&mut request, &mut fixture.blas, &mut fixture.deferred, &mut encoder)
            .unwrap();
        let generation = fixture.finish(encoder);

        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0].blas, kept);
        assert!(fixture.pipeline.observe_completed(&mut request, generation));
        assert_eq!(fixture.device.live_acceleration_structures(), 1);
        assert!(fixture.device.take_validation_errors().is_empty());
    }

    #[test]
    fn compacted_structure_can_be_refit() {
        let mut fixture = Fixture::new(1);
        let id = fixture.triangle(
            AccelerationStructureBuildFlags::ALLOW_UPDATE
                | AccelerationStructureBuildFlags::ALLOW_COMPACTION,
        );
        let original_size = fixture.blas.size(id).unwrap();

        let mut encoder = fixture.device.new_encoder();
        let mut request = fixture
            .blas
            .request_compaction(&[id], &fixture.pipeline, &mut encoder)
            .unwrap();
        fixture.finish(encoder);
        fixture.poll_until_ready(&mut request);

        let mut encoder = fixture.device.new_encoder();
        fixture
            .pipeline
            .compact_in_place(&mut request, &mut fixture.blas, &mut fixture.deferred, &mut encoder)
            .unwrap();
        fixture.finish(encoder);
        assert!(fixture.blas.size(id).unwrap() < original_size);

        let info = fixture
            .blas
            .refit(BlasUpdate {
                blas: id,
                geometry: GeometryUpdate::Unchanged,
            })
            .unwrap();
        let mut encoder = fixture.device.new_encoder();
        fixture
            .blas
            .build(&[info], &mut fixture.pool, &mut fixture.deferred, &mut encoder)
            .unwrap();
        fixture.finish(encoder);

        assert_eq!(fixture.blas.state(id).unwrap(), BlasState::Built);
        assert!(fixture.blas.size(id).unwrap() < original_size);
        assert!(fixture.device.take_validation_errors().is_empty());
    }

    #[test]
    fn discarded_detached_compaction_is_freed() {
        let mut fixture = Fixture::new(1);
        let id = fixture.triangle(AccelerationStructureBuildFlags::ALLOW_COMPACTION);
        let original_address = fixture.blas.address(id).unwrap();

        let mut encoder = fixture.device.new_encoder();
        let mut request = fixture
            .blas
            .request_compaction(&[id], &fixture.pipeline, &mut encoder)
            .unwrap();
        fixture.finish(encoder);
        fixture.poll_until_ready(&mut request);

        let mut encoder = fixture.device.new_encoder();
        let detached = fixture
            .pipeline
            .compact_detached(&mut request, &mut fixture.blas, &mut encoder)
            .unwrap();
        let copied = encoder.generation();
        assert_eq!(fixture.device.live_acceleration_structures(), 2);

        // Copy is still in flight, discarding defers it past the copy.
        fixture.pipeline.discard(
            request,
            detached,
            &mut fixture.blas,
            &mut fixture.deferred,
            copied.saturating_sub(1),
        );
        assert_eq!(fixture.deferred.len(), 1);
        fixture.finish(encoder);

        assert_eq!(fixture.device.live_acceleration_structures(), 1);
        assert_eq!(fixture.blas.address(id).unwrap(), original_address);
        assert!(!fixture.blas.is_compaction_pending(id).unwrap());
        assert!(fixture.device.take_validation_errors().is_empty());
    }
}
