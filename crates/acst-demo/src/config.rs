use std::path::Path;

use figa::Figa;
use miette::{Context, IntoDiagnostic};

/// Settings of the sample runner.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, figa::Figa)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of frames each sample runs.
    pub frames: u32,

    /// Number of command lists in flight before the loop waits.
    pub frames_in_flight: u32,

    /// Generations after which compacted sizes become readable.
    pub query_latency: u64,

    /// Capacity of the top-level structure.
    pub max_instances: u32,

    /// Device memory available to a sample, unlimited if not set.
    #[figa(replace)]
    pub memory_budget: Option<usize>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        DemoConfig {
            frames: 120,
            frames_in_flight: 2,
            query_latency: 2,
            max_instances: 64,
            memory_budget: None,
        }
    }
}

fn update_config_from_path(config: &mut DemoConfig, path: &Path) -> miette::Result<()> {
    let mut r = std::fs::read_to_string(path);

    if path.extension().is_none() {
        if let Err(err) = &r {
            if err.kind() == std::io::ErrorKind::NotFound {
                r = std::fs::read_to_string(path.with_extension("toml"));
            }
        }
    }

    if let Err(err) = &r {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Ok(());
        }
    }

    let s = r
        .into_diagnostic()
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    config
        .update(toml::Deserializer::new(&s))
        .into_diagnostic()
        .with_context(|| format!("Failed to update config from {}", path.display()))
}

fn update_config_from_env(config: &mut DemoConfig) -> miette::Result<()> {
    let de = denvars::Deserializer::from_prefixed_env_vars("ACST_")
        .with_options(denvars::Options::toml());

    config
        .update(de)
        .into_diagnostic()
        .context("Failed to update config from environment variables")
}

impl DemoConfig {
    /// Loads config from the user's config directory and the environment.
    pub fn load() -> miette::Result<Self> {
        let mut config = DemoConfig::default();
        if let Some(dir) = dirs::config_local_dir() {
            update_config_from_path(&mut config, &dir.join("acst/config"))?;
        }
        update_config_from_env(&mut config)?;
        Ok(config)
    }

    pub fn accel(&self) -> acst::AccelConfig {
        acst::AccelConfig {
            frames_in_flight: self.frames_in_flight,
            max_instances: self.max_instances,
            ..acst::AccelConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_defaults() {
        let mut config = DemoConfig::default();
        config
            .update(toml::Deserializer::new("frames = 10\nmemory_budget = 65536"))
            .unwrap();

        assert_eq!(config.frames, 10);
        assert_eq!(config.memory_budget, Some(65536));
        assert_eq!(config.frames_in_flight, 2);
    }

    #[test]
    fn later_layer_replaces_budget() {
        let mut config = DemoConfig::default();
        config
            .update(toml::Deserializer::new("memory_budget = 4096"))
            .unwrap();
        config
            .update(toml::Deserializer::new("memory_budget = 1024"))
            .unwrap();
        assert_eq!(config.memory_budget, Some(1024));

        // Layers that do not mention the budget keep it.
        config.update(toml::Deserializer::new("frames = 3")).unwrap();
        assert_eq!(config.memory_budget, Some(1024));
    }

    #[test]
    fn missing_file_is_ignored() {
        let mut config = DemoConfig::default();
        update_config_from_path(&mut config, Path::new("/nonexistent/acst/config")).unwrap();
        assert_eq!(config.frames, DemoConfig::default().frames);
    }
}
