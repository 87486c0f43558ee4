use acst::{AccelerationStructureBuildFlags, InstanceFlags, SceneInstance, SceneMesh, Transform3x4};
use miette::IntoDiagnostic;

use crate::{
    config::DemoConfig,
    frame::{FrameLoop, Summary},
    mesh::{Aabb, MeshData, SceneGeometry, Shape},
};

/// Procedural geometry: a grid of boxes resolved by an intersection shader.
pub fn run(config: &DemoConfig) -> miette::Result<Summary> {
    let mut frames = FrameLoop::new(config);
    let device = frames.device().clone();

    let boxes = (0..4)
        .flat_map(|z| (0..4).map(move |x| (x, z)))
        .map(|(x, z)| Aabb::around(na::Point3::new(x as f32, 0.0, z as f32), 0.25))
        .collect();

    let geometry = SceneGeometry::upload(&device, &[MeshData::single(Shape::Boxes(boxes))], 1)?;
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
                        name: "boxes",
                    }],
                    &mut frame.encoder,
                )
                .into_diagnostic()?;

            let instance = SceneInstance {
                flags: InstanceFlags::TRIANGLE_FACING_CULL_DISABLE,
                ..SceneInstance::new(ids[0], Transform3x4::IDENTITY)
            };
            frames
                .scene()
                .rebuild_tlas(&[instance], &mut frame.encoder)
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
