use acst::{AccelerationStructureBuildFlags, SceneInstance, SceneMesh};
use miette::IntoDiagnostic;

use crate::{
    config::DemoConfig,
    frame::{FrameLoop, Summary},
    mesh::{transform, MeshData, SceneGeometry, Shape, Triangles},
};

const INSTANCES: u32 = 8;

/// Cubes circling around their rest positions.
/// The top-level structure is rebuilt from scratch every frame.
pub fn run(config: &DemoConfig) -> miette::Result<Summary> {
    let mut frames = FrameLoop::new(config);
    let device = frames.device().clone();
    let count = INSTANCES.min(config.max_instances);

    let geometry = SceneGeometry::upload(
        &device,
        &[MeshData::single(Shape::Triangles(Triangles::cube(0.5)))],
        1,
    )?;
    let descriptors = geometry.descriptors(0, 0);

    let mut blas = None;
    for _ in 0..config.frames {
        let mut frame = frames.begin()?;

        let id = match blas {
            Some(id) => id,
            None => {
                let ids = frames
                    .scene()
                    .build_scene(
                        &[SceneMesh {
                            geometry: &descriptors,
                            flags: AccelerationStructureBuildFlags::empty(),
                            name: "cube",
                        }],
                        &mut frame.encoder,
                    )
                    .into_diagnostic()?;
                *blas.insert(ids[0])
            }
        };

        let instances: Vec<SceneInstance> = (0..count)
            .map(|i| {
                let phase = frame.time + i as f32;
                let offset = i as f32;
                let placement = na::Isometry3::from_parts(
                    na::Translation3::new(phase.cos() + offset, 0.0, phase.sin() + offset),
                    na::UnitQuaternion::from_euler_angles(0.0, frame.time, 0.0),
                );

                SceneInstance {
                    custom_index: i,
                    ..SceneInstance::new(id, transform(&placement.to_homogeneous()))
                }
            })
            .collect();

        frames
            .scene()
            .rebuild_tlas(&instances, &mut frame.encoder)
            .into_diagnostic()?;
        frames.trace_rays(&mut frame)?;
        frames.end(frame);
    }

    let summary = frames.finish()?;
    geometry.destroy(&device);

    super::expect_hits(&summary, count as usize)?;
    Ok(summary)
}
