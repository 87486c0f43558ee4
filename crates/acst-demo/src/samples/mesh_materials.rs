use acst::{AccelerationStructureBuildFlags, SceneInstance, SceneMesh, Transform3x4};
use miette::IntoDiagnostic;

use crate::{
    config::DemoConfig,
    frame::{FrameLoop, Summary},
    mesh::{MeshData, SceneGeometry, Shape, Triangles},
};

/// Meshes with several geometries each, materials indexed per geometry.
///
/// The instance custom index holds the mesh's first material,
/// a hit shader reads `materials[custom_index + geometry_index]`.
pub fn run(config: &DemoConfig) -> miette::Result<Summary> {
    let mut frames = FrameLoop::new(config);
    let device = frames.device().clone();

    let meshes = [
        MeshData {
            shapes: vec![
                Shape::Triangles(Triangles::cube(1.0)),
                Shape::Triangles(Triangles::quad(3.0)),
            ],
            transform: Some(na::Isometry3::translation(0.0, 0.5, 0.0)),
        },
        MeshData {
            shapes: vec![
                Shape::Triangles(Triangles::triangle()),
                Shape::Triangles(Triangles::grid(2, 1.0)),
                Shape::Triangles(Triangles::cube(0.25)),
            ],
            transform: None,
        },
    ];
    let geometry = SceneGeometry::upload(&device, &meshes, 1)?;
    let layout = geometry.layout();
    tracing::info!(
        "{} materials over {} meshes",
        layout.material_count(),
        layout.meshes().len()
    );

    let descriptors: Vec<_> = (0..meshes.len())
        .map(|mesh| geometry.descriptors(mesh, 0))
        .collect();
    let scene_meshes: Vec<SceneMesh<'_>> = descriptors
        .iter()
        .map(|geometry| SceneMesh {
            geometry,
            flags: AccelerationStructureBuildFlags::empty(),
            name: "material-mesh",
        })
        .collect();
    let first_materials: Vec<u32> = layout
        .meshes()
        .iter()
        .map(|mesh| mesh.first_material)
        .collect();

    for index in 0..config.frames {
        let mut frame = frames.begin()?;

        if index == 0 {
            let ids = frames
                .scene()
                .build_scene(&scene_meshes, &mut frame.encoder)
                .into_diagnostic()?;

            let instances: Vec<SceneInstance> = ids
                .iter()
                .zip(&first_materials)
                .enumerate()
                .map(|(i, (&id, &material))| SceneInstance {
                    custom_index: material,
                    ..SceneInstance::new(id, Transform3x4::from_translation(i as f32 * 4.0, 0.0, 0.0))
                })
                .collect();

            frames
                .scene()
                .rebuild_tlas(&instances, &mut frame.encoder)
                .into_diagnostic()?;
        }

        frames.trace_rays(&mut frame)?;
        frames.end(frame);
    }

    let summary = frames.finish()?;
    geometry.destroy(&device);

    super::expect_hits(&summary, meshes.len())?;

    for trace in &summary.traces {
        let found: Vec<u32> = trace.hits.iter().map(|hit| hit.custom_index).collect();
        if found != first_materials {
            miette::bail!(
                "Dispatch at {} reports material offsets {found:?}, expected {first_materials:?}",
                trace.generation
            );
        }
    }

    Ok(summary)
}
