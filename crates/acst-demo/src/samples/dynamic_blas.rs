use acst::{
    AccelerationStructureBuildFlags, BlasGeometryDesc, BlasUpdate, GeometryAddresses,
    GeometryUpdate, SceneInstance, SceneMesh, Transform3x4,
};
use miette::IntoDiagnostic;

use crate::{
    config::DemoConfig,
    frame::{FrameLoop, Summary},
    mesh::{MeshData, SceneGeometry, Shape, Triangles},
};

/// Triangle whose top vertex swings back and forth.
///
/// Vertex data is kept in one copy per frame in flight,
/// every frame writes the copy the device no longer reads
/// and refits the structure from its new address.
pub fn run(config: &DemoConfig) -> miette::Result<Summary> {
    let mut frames = FrameLoop::new(config);
    let device = frames.device().clone();

    let mut triangle = Triangles::triangle();
    let mut geometry = SceneGeometry::upload(
        &device,
        &[MeshData::single(Shape::Triangles(triangle.clone()))],
        frames.frames_in_flight(),
    )?;

    let mut frame = frames.begin()?;
    let descriptors = geometry.descriptors(0, 0);
    let ids = frames
        .scene()
        .build_scene(
            &[SceneMesh {
                geometry: &descriptors,
                flags: AccelerationStructureBuildFlags::ALLOW_UPDATE,
                name: "dynamic-triangle",
            }],
            &mut frame.encoder,
        )
        .into_diagnostic()?;
    let blas = ids[0];
    let instances = [SceneInstance::new(blas, Transform3x4::IDENTITY)];

    frames
        .scene()
        .rebuild_tlas(&instances, &mut frame.encoder)
        .into_diagnostic()?;
    frames.trace_rays(&mut frame)?;
    frames.end(frame);

    for _ in 1..config.frames {
        let mut frame = frames.begin()?;
        let copy = frame.index as usize % geometry.copies();

        triangle.positions[2].z = frame.time.sin();
        geometry.write_vertices(&device, 0, copy, &triangle)?;

        let addresses: Vec<GeometryAddresses> = geometry
            .descriptors(0, copy)
            .iter()
            .map(BlasGeometryDesc::addresses)
            .collect();

        frames
            .scene()
            .refit(
                &[BlasUpdate {
                    blas,
                    geometry: GeometryUpdate::Addresses(&addresses),
                }],
                &mut frame.encoder,
            )
            .into_diagnostic()?;

        frames
            .scene()
            .rebuild_tlas(&instances, &mut frame.encoder)
            .into_diagnostic()?;
        frames.trace_rays(&mut frame)?;
        frames.end(frame);
    }

    let summary = frames.finish()?;
    geometry.destroy(&device);

    super::expect_hits(&summary, 1)?;
    Ok(summary)
}
