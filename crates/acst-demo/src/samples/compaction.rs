use acst::{AccelerationStructureBuildFlags, BlasId, SceneInstance, SceneMesh, Transform3x4};
use miette::IntoDiagnostic;

use crate::{
    config::DemoConfig,
    frame::{FrameLoop, Summary},
    mesh::{MeshData, SceneGeometry, Shape, Triangles},
};

/// Static meshes compacted once their sizes are known.
///
/// Instances refer to structures by handle, so the rebuild after
/// compaction picks up the new addresses without any bookkeeping here.
pub fn run(config: &DemoConfig) -> miette::Result<Summary> {
    let mut frames = FrameLoop::new(config);
    let device = frames.device().clone();

    let meshes = [
        MeshData::single(Shape::Triangles(Triangles::grid(16, 8.0))),
        MeshData::single(Shape::Triangles(Triangles::cube(1.0))),
        MeshData::single(Shape::Triangles(Triangles::quad(2.0))),
    ];
    let geometry = SceneGeometry::upload(&device, &meshes, 1)?;
    let descriptors: Vec<_> = (0..meshes.len())
        .map(|mesh| geometry.descriptors(mesh, 0))
        .collect();

    let mut frame = frames.begin()?;
    let scene_meshes: Vec<SceneMesh<'_>> = descriptors
        .iter()
        .zip(["ground", "cube", "quad"])
        .map(|(geometry, name)| SceneMesh {
            geometry,
            flags: AccelerationStructureBuildFlags::ALLOW_COMPACTION,
            name,
        })
        .collect();

    let ids = frames
        .scene()
        .build_scene(&scene_meshes, &mut frame.encoder)
        .into_diagnostic()?;
    let ticket = frames
        .scene()
        .request_compaction(&ids, &mut frame.encoder)
        .into_diagnostic()?;

    let original = total_size(&mut frames, &ids)?;
    let instances: Vec<SceneInstance> = ids
        .iter()
        .enumerate()
        .map(|(index, &id)| {
            SceneInstance::new(id, Transform3x4::from_translation(index as f32 * 3.0, 0.0, 0.0))
        })
        .collect();

    frames
        .scene()
        .rebuild_tlas(&instances, &mut frame.encoder)
        .into_diagnostic()?;
    frames.trace_rays(&mut frame)?;
    frames.end(frame);

    let mut compacted_at = None;
    for _ in 1..config.frames {
        let mut frame = frames.begin()?;

        if compacted_at.is_none()
            && frames
                .scene()
                .poll_compaction(ticket, &mut frame.encoder)
                .into_diagnostic()?
        {
            compacted_at = Some(frame.index);
        }

        frames
            .scene()
            .rebuild_tlas(&instances, &mut frame.encoder)
            .into_diagnostic()?;
        frames.trace_rays(&mut frame)?;
        frames.end(frame);
    }

    let compacted = total_size(&mut frames, &ids)?;
    match compacted_at {
        Some(index) => tracing::info!(
            "Compacted at frame {index}: {original} -> {compacted} bytes"
        ),
        None => tracing::warn!("Compacted sizes were not ready within {} frames", config.frames),
    }

    let summary = frames.finish()?;
    geometry.destroy(&device);

    super::expect_hits(&summary, ids.len())?;

    // Compaction must not change what rays hit.
    if let Some(first) = summary.traces.first() {
        for trace in &summary.traces {
            let same = trace
                .hits
                .iter()
                .zip(&first.hits)
                .all(|(a, b)| a.geometry == b.geometry);
            if !same {
                miette::bail!("Geometry hit at {} differs from the first frame", trace.generation);
            }
        }
    }

    Ok(summary)
}

fn total_size(frames: &mut FrameLoop, ids: &[BlasId]) -> miette::Result<usize> {
    let blas = frames.scene().blas();
    ids.iter()
        .map(|&id| blas.size(id).into_diagnostic())
        .sum()
}
