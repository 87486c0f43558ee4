use slab::Slab;

use crate::{
    blas::{BlasDesc, BlasId, BlasManager, BlasUpdate},
    compaction::{CompactedBlas, CompactionPipeline, CompactionRequest, CompactionState},
    config::AccelConfig,
    deferred::DeferredDestructionQueue,
    error::SceneError,
    generic::{
        AccelerationStructureBuildFlags, BlasGeometryDesc, DeviceAddress, Generation,
        InstanceFlags, InstanceRecord, Transform3x4,
    },
    scratch::ScratchPool,
    tlas::TlasManager,
    traits::{CommandEncoder, Device},
};

/// Placement of a bottom-level structure in the scene.
///
/// Refers to the structure by handle, so the live address
/// is resolved at every rebuild.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneInstance {
    pub blas: BlasId,
    pub transform: Transform3x4,
    pub custom_index: u32,
    pub mask: u8,
    pub flags: InstanceFlags,
    pub sbt_offset: u32,
}

impl SceneInstance {
    pub fn new(blas: BlasId, transform: Transform3x4) -> Self {
        SceneInstance {
            blas,
            transform,
            custom_index: 0,
            mask: 0xFF,
            flags: InstanceFlags::empty(),
            sbt_offset: 0,
        }
    }
}

/// Geometry of one bottom-level structure of a scene.
#[derive(Clone, Copy, Debug)]
pub struct SceneMesh<'a> {
    pub geometry: &'a [BlasGeometryDesc],
    pub flags: AccelerationStructureBuildFlags,
    pub name: &'a str,
}

/// Handle of a compaction request owned by [`SceneAccel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompactionTicket {
    key: usize,
    serial: u64,
}

/// Single owner of a scene's acceleration structures.
///
/// Every resource that may still be referenced by submitted commands
/// is freed through the deferred destruction queue. The frame loop
/// reports completed generations with [`SceneAccel::retire_deferred`].
pub struct SceneAccel<D: Device> {
    config: AccelConfig,
    blas: BlasManager<D>,
    tlas: TlasManager<D>,
    compaction: CompactionPipeline<D>,
    requests: Slab<(u64, CompactionRequest<D>)>,
    next_ticket: u64,
    scratch: ScratchPool<D>,
    deferred: DeferredDestructionQueue<D>,
}

impl<D> SceneAccel<D>
where
    D: Device,
{
    pub fn new(device: D, config: AccelConfig) -> Self {
        SceneAccel {
            blas: BlasManager::new(device.clone()),
            tlas: TlasManager::new(device.clone(), &config),
            compaction: CompactionPipeline::new(device.clone()),
            requests: Slab::new(),
            next_ticket: 0,
            scratch: ScratchPool::new(device.clone(), "blas-scratch"),
            deferred: DeferredDestructionQueue::new(device),
            config,
        }
    }

    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    pub fn blas(&self) -> &BlasManager<D> {
        &self.blas
    }

    pub fn tlas(&self) -> &TlasManager<D> {
        &self.tlas
    }

    /// Number of resources waiting for their generation to complete.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Creates and builds one bottom-level structure per mesh.
    ///
    /// All builds share one scratch allocation and one pair of barriers.
    pub fn build_scene(
        &mut self,
        meshes: &[SceneMesh<'_>],
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<Vec<BlasId>, SceneError> {
        let mut ids = Vec::with_capacity(meshes.len());
        let mut infos = Vec::with_capacity(meshes.len());

        for mesh in meshes {
            let created = self.blas.create(BlasDesc {
                geometry: mesh.geometry,
                flags: mesh.flags,
                performance: self.config.blas_performance,
                name: mesh.name,
            });

            match created {
                Ok((id, info)) => {
                    ids.push(id);
                    infos.push(info);
                }
                Err(err) => {
                    self.discard(&ids, encoder.generation());
                    return Err(err.into());
                }
            }
        }

        if let Err(err) = self
            .blas
            .build(&infos, &mut self.scratch, &mut self.deferred, encoder)
        {
            self.discard(&ids, encoder.generation());
            return Err(err.into());
        }

        tracing::debug!("Scene built with {} BLAS", ids.len());
        Ok(ids)
    }

    fn discard(&mut self, ids: &[BlasId], generation: Generation) {
        for &id in ids {
            if let Err(err) = self.blas.destroy(id, &mut self.deferred, generation) {
                tracing::error!("Failed to discard BLAS of a failed scene build: {err}");
                debug_assert!(false, "{err}");
            }
        }
    }

    /// Refits structures in place and records the updates as one batch.
    pub fn refit(
        &mut self,
        updates: &[BlasUpdate<'_>],
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<(), SceneError> {
        let infos = updates
            .iter()
            .map(|update| self.blas.refit(*update))
            .collect::<Result<Vec<_>, _>>()?;

        self.blas
            .build(&infos, &mut self.scratch, &mut self.deferred, encoder)?;
        Ok(())
    }

    /// Rebuilds the top-level structure from scratch.
    ///
    /// Returns address of the new structure for binding into ray dispatches.
    pub fn rebuild_tlas(
        &mut self,
        instances: &[SceneInstance],
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<DeviceAddress, SceneError> {
        let records = instances
            .iter()
            .map(|instance| -> Result<InstanceRecord, SceneError> {
                let address = self.blas.address(instance.blas)?;
                Ok(InstanceRecord::new(address, instance.transform)
                    .with_custom_index(instance.custom_index)
                    .with_mask(instance.mask)
                    .with_flags(instance.flags)
                    .with_sbt_offset(instance.sbt_offset))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.rebuild_tlas_records(&records, encoder)
    }

    /// Rebuilds the top-level structure from raw records.
    ///
    /// Records referencing superseded addresses are rejected.
    pub fn rebuild_tlas_records(
        &mut self,
        records: &[InstanceRecord],
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<DeviceAddress, SceneError> {
        let address = self
            .tlas
            .rebuild(records, &self.blas, &mut self.deferred, encoder)?;
        Ok(address)
    }

    /// Issues compaction size query for `ids`.
    pub fn request_compaction(
        &mut self,
        ids: &[BlasId],
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<CompactionTicket, SceneError> {
        let request = self
            .blas
            .request_compaction(ids, &self.compaction, encoder)?;
        let serial = self.next_ticket;
        self.next_ticket += 1;
        let key = self.requests.insert((serial, request));
        Ok(CompactionTicket { key, serial })
    }

    /// Advances compaction, call once per frame.
    ///
    /// When sizes become available the compacting copies are recorded
    /// into `encoder` and compacted structures replace live ones.
    /// Returns `true` once that happened, top-level structures built
    /// afterwards pick up the new addresses.
    /// The ticket is released when the originals retire.
    pub fn poll_compaction(
        &mut self,
        ticket: CompactionTicket,
        encoder: &mut impl CommandEncoder<D>,
    ) -> Result<bool, SceneError> {
        let request = match self.requests.get_mut(ticket.key) {
            Some((serial, request)) if *serial == ticket.serial => request,
            _ => return Err(SceneError::UnknownTicket(ticket)),
        };

        match request.state() {
            CompactionState::Pending => {
                if !self.compaction.poll(request, encoder.generation())? {
                    return Ok(false);
                }
            }
            CompactionState::SizesReady => {}
            _ => return Ok(true),
        }

        let compacted: Vec<CompactedBlas> = self.compaction.compact_in_place(
            request,
            &mut self.blas,
            &mut self.deferred,
            encoder,
        )?;

        let saved: usize = compacted.iter().map(|c| c.retired_size - c.size).sum();
        tracing::debug!("Compaction saved {saved} bytes over {} BLAS", compacted.len());
        Ok(true)
    }

    pub fn compaction_state(&self, ticket: CompactionTicket) -> Option<CompactionState> {
        match self.requests.get(ticket.key) {
            Some((serial, request)) if *serial == ticket.serial => Some(request.state()),
            _ => None,
        }
    }

    /// Destroys a bottom-level structure after the current command list completes.
    ///
    /// Instances referencing it must be dropped before the next rebuild.
    pub fn destroy_blas(
        &mut self,
        id: BlasId,
        encoder: &impl CommandEncoder<D>,
    ) -> Result<(), SceneError> {
        self.blas
            .destroy(id, &mut self.deferred, encoder.generation())?;
        Ok(())
    }

    /// Reports that every command list up to `completed` finished executing.
    ///
    /// Frees deferred resources and finalizes compaction requests.
    /// Returns number of freed resources.
    pub fn retire_deferred(&mut self, completed: Generation) -> usize {
        self.blas.observe_completed(completed);
        self.tlas.observe_completed(completed);

        let compaction = &self.compaction;
        self.requests
            .retain(|_, (_, request)| !compaction.observe_completed(request, completed));

        self.deferred.retire(completed)
    }

    /// Releases every resource.
    ///
    /// The device must be idle.
    pub fn destroy_idle(mut self) {
        let generation = self
            .deferred
            .completed()
            .map_or(Generation::ZERO, Generation::next);
        for (_, request) in self.requests.drain() {
            self.compaction
                .abandon(request, &mut self.blas, &mut self.deferred, generation);
        }
        self.blas.destroy_all(&mut self.deferred, generation);
        self.tlas.destroy(&mut self.deferred, generation);
        self.scratch.release(&mut self.deferred, generation);
        self.deferred.destroy_all_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blas::GeometryUpdate,
        error::TlasError,
        generic::{BlasAabbs, BlasTriangles, GeometryAddresses, VertexFormat},
        headless::{HeadlessDevice, HeadlessEncoder},
        traits::Buffer,
    };

    struct Frames {
        device: HeadlessDevice,
        scene: SceneAccel<HeadlessDevice>,
        in_flight: std::collections::VecDeque<Generation>,
    }

    impl Frames {
        fn new(device: HeadlessDevice) -> Self {
            Frames {
                scene: SceneAccel::new(device.clone(), AccelConfig::default()),
                device,
                in_flight: Default::default(),
            }
        }

        /// Double-buffered frame begin: waits for the frame two behind.
        fn begin(&mut self) -> HeadlessEncoder {
            if self.in_flight.len() == 2 {
                if let Some(generation) = self.in_flight.pop_front() {
                    self.device.complete(generation);
                    self.scene.retire_deferred(generation);
                }
            }
            self.device.new_encoder()
        }

        fn end(&mut self, encoder: HeadlessEncoder) {
            self.in_flight.push_back(encoder.generation());
            self.device.submit(encoder);
        }

        fn idle(&mut self) {
            let completed = self.device.wait_idle();
            self.in_flight.clear();
            self.scene.retire_deferred(completed);
        }
    }

    fn triangles(vertices: DeviceAddress, primitive_count: u32) -> BlasGeometryDesc {
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

    #[test]
    fn animated_scene_with_compaction() {
        let device = HeadlessDevice::with_query_latency(3);
        let mut frames = Frames::new(device.clone());

        let vertices = [
            device.new_geometry_buffer(4096).unwrap(),
            device.new_geometry_buffer(4096).unwrap(),
        ];
        let boxes = device.new_geometry_buffer(1024).unwrap();

        let dynamic_geometry = [triangles(vertices[0].address(), 4)];
        let static_geometry = [triangles(vertices[0].address(), 1)];
        let box_geometry = [BlasGeometryDesc::Aabbs(BlasAabbs {
            opaque: false,
            boxes: boxes.address(),
            box_stride: 24,
            primitive_count: 2,
        })];

        let mut encoder = frames.begin();
        let ids = frames
            .scene
            .build_scene(
                &[
                    SceneMesh {
                        geometry: &dynamic_geometry,
                        flags: AccelerationStructureBuildFlags::ALLOW_UPDATE,
                        name: "dynamic",
                    },
                    SceneMesh {
                        geometry: &static_geometry,
                        flags: AccelerationStructureBuildFlags::ALLOW_COMPACTION,
                        name: "static",
                    },
                    SceneMesh {
                        geometry: &box_geometry,
                        flags: AccelerationStructureBuildFlags::ALLOW_COMPACTION,
                        name: "boxes",
                    },
                ],
                &mut encoder,
            )
            .unwrap();
        let ticket = frames
            .scene
            .request_compaction(&ids[1..], &mut encoder)
            .unwrap();
        frames.end(encoder);

        let original_static = frames.scene.blas().address(ids[1]).unwrap();
        let original_size = frames.scene.blas().size(ids[1]).unwrap();
        let mut compacted_at = None;

        for frame in 0..12u32 {
            let mut encoder = frames.begin();

            if compacted_at.is_none()
                && frames.scene.poll_compaction(ticket, &mut encoder).unwrap()
            {
                compacted_at = Some(frame);
            }

            let addresses = [GeometryAddresses {
                data: vertices[(frame % 2) as usize].address(),
                indices: None,
                transform: None,
            }];
            frames
                .scene
                .refit(
                    &[BlasUpdate {
                        blas: ids[0],
                        geometry: GeometryUpdate::Addresses(&addresses),
                    }],
                    &mut encoder,
                )
                .unwrap();

            let instances: Vec<_> = ids
                .iter()
                .enumerate()
                .map(|(index, &blas)| SceneInstance {
                    custom_index: index as u32,
                    flags: InstanceFlags::FORCE_OPAQUE,
                    ..SceneInstance::new(
                        blas,
                        Transform3x4::from_translation(frame as f32, index as f32, 0.0),
                    )
                })
                .collect();
            frames.scene.rebuild_tlas(&instances, &mut encoder).unwrap();
            encoder.trace_rays(frames.scene.tlas().current().unwrap());
            frames.end(encoder);
        }
        frames.idle();

        assert!(compacted_at.is_some());
        assert_eq!(
            frames.scene.compaction_state(ticket),
            None,
            "finished request is dropped once originals retire"
        );
        assert_ne!(frames.scene.blas().address(ids[1]).unwrap(), original_static);
        assert!(frames.scene.blas().size(ids[1]).unwrap() <= original_size);
        assert_eq!(frames.scene.deferred_len(), 0);

        // 3 BLAS and the live TLAS.
        assert_eq!(device.live_acceleration_structures(), 4);
        assert_eq!(device.take_traces().len(), 12);
        assert!(device.take_validation_errors().is_empty());

        frames.scene.destroy_idle();
        assert_eq!(device.live_acceleration_structures(), 0);
    }

    #[test]
    fn raw_records_with_retired_address_are_rejected() {
        let device = HeadlessDevice::default();
        let mut frames = Frames::new(device.clone());
        let vertices = device.new_geometry_buffer(1024).unwrap();
        let geometry = [triangles(vertices.address(), 1)];

        let mut encoder = frames.begin();
        let ids = frames
            .scene
            .build_scene(
                &[SceneMesh {
                    geometry: &geometry,
                    flags: AccelerationStructureBuildFlags::ALLOW_COMPACTION,
                    name: "triangle",
                }],
                &mut encoder,
            )
            .unwrap();
        let old = InstanceRecord::new(
            frames.scene.blas().address(ids[0]).unwrap(),
            Transform3x4::IDENTITY,
        );
        frames.scene.rebuild_tlas_records(&[old], &mut encoder).unwrap();
        let ticket = frames.scene.request_compaction(&ids, &mut encoder).unwrap();
        frames.end(encoder);

        let mut ready = false;
        while !ready {
            let mut encoder = frames.begin();
            ready = frames.scene.poll_compaction(ticket, &mut encoder).unwrap();
            if ready {
                let err = frames
                    .scene
                    .rebuild_tlas_records(&[old], &mut encoder)
                    .unwrap_err();
                assert!(matches!(
                    err,
                    SceneError::Tlas(TlasError::StaleInstance { index: 0, .. })
                ));
            }
            frames.end(encoder);
        }
        frames.idle();
        frames.scene.destroy_idle();
    }

    #[test]
    fn failed_scene_build_releases_created_structures() {
        let limits = crate::generic::DeviceLimits {
            max_primitive_count: 4,
            ..Default::default()
        };
        let device = HeadlessDevice::new(limits, None, 1);
        let mut frames = Frames::new(device.clone());
        let vertices = device.new_geometry_buffer(1024).unwrap();
        let small = [triangles(vertices.address(), 1)];
        let large = [triangles(vertices.address(), 8)];

        let mut encoder = frames.begin();
        let err = frames
            .scene
            .build_scene(
                &[
                    SceneMesh {
                        geometry: &small,
                        flags: AccelerationStructureBuildFlags::empty(),
                        name: "small",
                    },
                    SceneMesh {
                        geometry: &large,
                        flags: AccelerationStructureBuildFlags::empty(),
                        name: "large",
                    },
                ],
                &mut encoder,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SceneError::Build(crate::error::BuildError::TooManyPrimitives { count: 8, limit: 4 })
        ));
        assert!(frames.scene.blas().is_empty());
        assert_eq!(frames.scene.deferred_len(), 1);

        frames.end(encoder);
        frames.idle();
        assert_eq!(frames.scene.deferred_len(), 0);
        assert_eq!(device.live_acceleration_structures(), 0);
        assert!(device.take_validation_errors().is_empty());
    }

    #[test]
    fn unknown_handles_are_errors() {
        let device = HeadlessDevice::default();
        let mut frames = Frames::new(device.clone());
        let vertices = device.new_geometry_buffer(1024).unwrap();
        let geometry = [triangles(vertices.address(), 1)];

        let mut encoder = frames.begin();
        let ids = frames
            .scene
            .build_scene(
                &[SceneMesh {
                    geometry: &geometry,
                    flags: AccelerationStructureBuildFlags::empty(),
                    name: "triangle",
                }],
                &mut encoder,
            )
            .unwrap();
        frames.scene.destroy_blas(ids[0], &encoder).unwrap();

        let err = frames
            .scene
            .rebuild_tlas(&[SceneInstance::new(ids[0], Transform3x4::IDENTITY)], &mut encoder)
            .unwrap_err();
        assert!(matches!(err, SceneError::UnknownBlas(_)));

        let err = frames
            .scene
            .poll_compaction(
                CompactionTicket {
                    key: 7,
                    serial: 7,
                },
                &mut encoder,
            )
            .unwrap_err();
        assert!(matches!(err, SceneError::UnknownTicket(_)));

        frames.end(encoder);
        frames.idle();
        assert_eq!(device.live_acceleration_structures(), 0);
        assert!(device.take_validation_errors().is_empty());
    }
}
