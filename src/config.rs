//! Engine-wide configuration.
//!
//! A `Default` impl that reads environment variables with sane fallbacks,
//! built once at the composition root and passed down to whatever
//! constructs the connector registry and run contexts.

use std::path::PathBuf;

/// Resolved filesystem layout and default timeouts for a running engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory that `uploads/<name>` paths resolve against (tabular
    /// file source).
    pub data_dir: PathBuf,
    /// Root directory that non-`uploads/` tabular destination paths resolve
    /// against: `<data_dir>/storage/workflow_results/`.
    pub results_dir: PathBuf,
    /// Upper bound on any run's deadline, regardless of what the caller asks
    /// for.
    pub max_run_deadline_secs: u64,
    /// Default per-connector I/O timeout when a connector's own config
    /// doesn't specify one.
    pub default_io_timeout_secs: u64,
}

impl EngineConfig {
    pub fn results_dir_path(&self) -> PathBuf {
        self.data_dir.join("storage").join("workflow_results")
    }

    /// Resolve a connector-supplied `file_path` for *reads*: `uploads/<name>`
    /// is reserved and always resolves under `data_dir`.
    pub fn resolve_source_path(&self, file_path: &str) -> PathBuf {
        self.data_dir.join(file_path)
    }

    /// Resolve a connector-supplied `file_path` for *writes*: `uploads/`
    /// paths still resolve under `data_dir`; everything else resolves under
    /// the results directory.
    pub fn resolve_destination_path(&self, file_path: &str) -> PathBuf {
        if file_path.starts_with("uploads/") {
            self.data_dir.join(file_path)
        } else {
            self.results_dir_path().join(file_path)
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = std::env::var("MESHFLOW_DATA_DIR")
            .unwrap_or_else(|_| "data".to_string())
            .into();
        Self {
            data_dir,
            results_dir: "storage/workflow_results".into(),
            max_run_deadline_secs: std::env::var("MESHFLOW_MAX_RUN_DEADLINE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            default_io_timeout_secs: std::env::var("MESHFLOW_DEFAULT_IO_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uploads_paths_resolve_under_data_dir_both_ways() {
        let cfg = EngineConfig {
            data_dir: PathBuf::from("data"),
            ..EngineConfig::default()
        };
        assert_eq!(cfg.resolve_source_path("uploads/a.csv"), PathBuf::from("data/uploads/a.csv"));
        assert_eq!(cfg.resolve_destination_path("uploads/a.csv"), PathBuf::from("data/uploads/a.csv"));
    }

    #[test]
    fn non_uploads_destination_resolves_under_results_dir() {
        let cfg = EngineConfig {
            data_dir: PathBuf::from("data"),
            ..EngineConfig::default()
        };
        let resolved = cfg.resolve_destination_path("out.csv");
        assert_eq!(resolved, PathBuf::from("data/storage/workflow_results/out.csv"));
    }
}
