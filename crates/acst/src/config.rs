use serde::{Deserialize, Serialize};

use crate::generic::AccelerationStructurePerformance;

/// Configuration of acceleration structure management.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    /// Number of command lists the frame loop keeps in flight.
    /// Sizes the instance upload ring.
    pub frames_in_flight: u32,

    /// Capacity of the top-level structure, fixed at creation.
    pub max_instances: u32,

    pub tlas_performance: AccelerationStructurePerformance,
    pub blas_performance: AccelerationStructurePerformance,
}

impl Default for AccelConfig {
    fn default() -> Self {
        AccelConfig {
            frames_in_flight: 2,
            max_instances: 1024,
            tlas_performance: AccelerationStructurePerformance::FastTrace,
            blas_performance: AccelerationStructurePerformance::FastTrace,
        }
    }
}
