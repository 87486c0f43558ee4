//! Sample scenes, each a thin caller of [`acst::SceneAccel`].

mod box_intersections;
mod compaction;
mod dynamic_blas;
mod dynamic_tlas;
mod hello_triangle;
mod mesh_materials;

use crate::{config::DemoConfig, frame::Summary};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sample {
    HelloTriangle,
    DynamicBlas,
    DynamicTlas,
    Compaction,
    MeshMaterials,
    BoxIntersections,
}

impl Sample {
    pub const ALL: [Sample; 6] = [
        Sample::HelloTriangle,
        Sample::DynamicBlas,
        Sample::DynamicTlas,
        Sample::Compaction,
        Sample::MeshMaterials,
        Sample::BoxIntersections,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Sample::HelloTriangle => "hello-triangle",
            Sample::DynamicBlas => "dynamic-blas",
            Sample::DynamicTlas => "dynamic-tlas",
            Sample::Compaction => "compaction",
            Sample::MeshMaterials => "mesh-materials",
            Sample::BoxIntersections => "box-intersections",
        }
    }

    pub fn run(&self, config: &DemoConfig) -> miette::Result<Summary> {
        let _span = tracing::info_span!("sample", name = self.name()).entered();

        match self {
            Sample::HelloTriangle => hello_triangle::run(config),
            Sample::DynamicBlas => dynamic_blas::run(config),
            Sample::DynamicTlas => dynamic_tlas::run(config),
            Sample::Compaction => compaction::run(config),
            Sample::MeshMaterials => mesh_materials::run(config),
            Sample::BoxIntersections => box_intersections::run(config),
        }
    }
}

/// Fails unless every dispatch hit `expected` instances.
fn expect_hits(summary: &Summary, expected: usize) -> miette::Result<()> {
    if summary.traces.len() != summary.frames as usize {
        miette::bail!(
            "{} dispatches executed over {} frames",
            summary.traces.len(),
            summary.frames
        );
    }

    if let Some(trace) = summary.traces.iter().find(|t| t.hits.len() != expected) {
        miette::bail!(
            "Dispatch at {} hit {} instances, expected {expected}",
            trace.generation,
            trace.hits.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(frames: u32) -> DemoConfig {
        DemoConfig {
            frames,
            query_latency: 1,
            ..DemoConfig::default()
        }
    }

    #[test]
    fn every_sample_runs_clean() {
        for sample in Sample::ALL {
            let summary = sample
                .run(&config(8))
                .unwrap_or_else(|err| panic!("{} failed: {err:?}", sample.name()));
            assert_eq!(summary.frames, 8, "{}", sample.name());
            assert_eq!(summary.traces.len(), 8, "{}", sample.name());
        }
    }

    #[test]
    fn samples_survive_deeper_pipelines() {
        let config = DemoConfig {
            frames_in_flight: 3,
            query_latency: 4,
            ..config(12)
        };
        for sample in [Sample::DynamicBlas, Sample::Compaction] {
            sample
                .run(&config)
                .unwrap_or_else(|err| panic!("{} failed: {err:?}", sample.name()));
        }
    }

    #[test]
    fn exhausted_budget_is_reported() {
        let config = DemoConfig {
            memory_budget: Some(64),
            ..config(4)
        };
        assert!(Sample::HelloTriangle.run(&config).is_err());
    }
}
