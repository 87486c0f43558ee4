use acst::{AccelerationStructureBuildFlags, SceneInstance, SceneMesh, Transform3x4};
use miette::IntoDiagnostic;

use crate::{
    config::DemoConfig,
    frame::{FrameLoop, Summary},
    mesh::{MeshData, SceneGeometry, Shape, Triangles},
};

/// Single triangle, built once and traced every frame.
pub fn run(config: &DemoConfig) -> miette::Result<Summary> {
    let mut frames = FrameLoop::new(config);
    let device = frames.device().clone();

    let geometry = SceneGeometry::upload(
        &device,
        &[MeshData::single(Shape::Triangles(Triangles::triangle()))],
        1,
    )?;
    let descriptors = geometry.descriptors(0, 0);

    for index in 0..config.frames {
        let mut frame = frames.begin()?;

        if index == 0 {
            let ids = frames
                .scene()
                .build_scene(
                    &[SceneMesh {
                        geometry: &descriptors,
                        flags: AccelerationStructureBuildFlags::empty(),
                        name: "triangle",
                    }],
                    &mut frame.encoder,
                )
                .into_diagnostic()?;

            frames
                .scene()
                .rebuild_tlas(
                    &[SceneInstance::new(ids[0], Transform3x4::IDENTITY)],
                    &mut frame.encoder,
                )
                .into_diagnostic()?;
        }

        frames.trace_rays(&mut frame)?;
        frames.end(frame);
    }

    let summary = frames.finish()?;
    geometry.destroy(&device);

    super::expect_hits(&summary, 1)?;
    Ok(summary)
}
