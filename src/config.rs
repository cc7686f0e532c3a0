//! Configuration file support for cinder
//!
//! Config files are loaded in order (later overrides earlier):
//! 1. `~/.config/cinder/config.toml` (user defaults)
//! 2. `.cinder.toml` in the working directory (project overrides)
//!
//! CLI flags override all config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Options loaded from config files. Every field is optional; unset fields
/// fall back to the defaults in [`Settings`].
///
/// # Example
///
/// ```toml
/// # ~/.config/cinder/config.toml or .cinder.toml
/// embedding_dim = 384
/// batch_size = 400
/// cache_capacity = 200000
/// worker_max = 4
/// mem_stop_pct = 78.0
/// mem_resume_pct = 69.0
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory from which workers load model artifacts
    pub model_cache_path: Option<PathBuf>,
    /// Backing file for the shared embedding cache
    pub cache_file_path: Option<PathBuf>,
    /// Number of cache slots
    pub cache_capacity: Option<u32>,
    /// Embedding dimension
    pub embedding_dim: Option<u32>,
    /// Chunks per batch
    pub batch_size: Option<usize>,
    /// Partial-batch flush deadline in milliseconds
    pub batch_flush_ms: Option<u64>,
    /// Resource monitor sampling interval in milliseconds
    pub sample_interval_ms: Option<u64>,
    /// Memory hysteresis: pause at/above this used percentage
    pub mem_stop_pct: Option<f32>,
    /// Memory hysteresis: resume at/below this used percentage
    pub mem_resume_pct: Option<f32>,
    /// CPU hysteresis: pause at/above this usage percentage
    pub cpu_stop_pct: Option<f32>,
    /// CPU hysteresis: resume at/below this usage percentage
    pub cpu_resume_pct: Option<f32>,
    /// Pool lower bound
    pub worker_min: Option<usize>,
    /// Pool upper bound (clamped to host cores)
    pub worker_max: Option<usize>,
    /// Idle time before a worker is eligible for scale-down, in ms
    pub worker_idle_ms: Option<u64>,
    /// Minimum worker lifetime before scale-down, in ms
    pub worker_min_life_ms: Option<u64>,
    /// Re-enqueue cap for failed batches
    pub max_attempts: Option<u32>,
    /// Grace period before drain escalates to OS termination, in ms
    pub drain_grace_ms: Option<u64>,
    /// Deferred-set cap while degraded
    pub deferred_cap: Option<usize>,
    /// Embedding backend workers load ("hash", or "onnx" with the feature)
    pub backend: Option<String>,
}

impl Config {
    /// Load configuration from user and project config files.
    pub fn load(project_root: &Path) -> Self {
        let user_config = dirs::config_dir()
            .map(|d| d.join("cinder/config.toml"))
            .and_then(|p| Self::load_file(&p))
            .unwrap_or_default();

        let project_config =
            Self::load_file(&project_root.join(".cinder.toml")).unwrap_or_default();

        user_config.override_with(project_config)
    }

    /// Load configuration from a specific file.
    fn load_file(path: &Path) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read config {}: {}", path.display(), e);
                return None;
            }
        };

        match toml::from_str::<Self>(&content) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "Loaded config");
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Layer another config on top (other overrides self where present).
    fn override_with(self, other: Self) -> Self {
        Config {
            model_cache_path: other.model_cache_path.or(self.model_cache_path),
            cache_file_path: other.cache_file_path.or(self.cache_file_path),
            cache_capacity: other.cache_capacity.or(self.cache_capacity),
            embedding_dim: other.embedding_dim.or(self.embedding_dim),
            batch_size: other.batch_size.or(self.batch_size),
            batch_flush_ms: other.batch_flush_ms.or(self.batch_flush_ms),
            sample_interval_ms: other.sample_interval_ms.or(self.sample_interval_ms),
            mem_stop_pct: other.mem_stop_pct.or(self.mem_stop_pct),
            mem_resume_pct: other.mem_resume_pct.or(self.mem_resume_pct),
            cpu_stop_pct: other.cpu_stop_pct.or(self.cpu_stop_pct),
            cpu_resume_pct: other.cpu_resume_pct.or(self.cpu_resume_pct),
            worker_min: other.worker_min.or(self.worker_min),
            worker_max: other.worker_max.or(self.worker_max),
            worker_idle_ms: other.worker_idle_ms.or(self.worker_idle_ms),
            worker_min_life_ms: other.worker_min_life_ms.or(self.worker_min_life_ms),
            max_attempts: other.max_attempts.or(self.max_attempts),
            drain_grace_ms: other.drain_grace_ms.or(self.drain_grace_ms),
            deferred_cap: other.deferred_cap.or(self.deferred_cap),
            backend: other.backend.or(self.backend),
        }
    }

    /// Resolve into concrete settings, filling defaults.
    pub fn resolve(self) -> Settings {
        let defaults = Settings::default();
        let worker_min = self.worker_min.unwrap_or(defaults.worker_min).max(1);
        Settings {
            model_cache_path: self.model_cache_path.unwrap_or(defaults.model_cache_path),
            cache_file_path: self.cache_file_path.unwrap_or(defaults.cache_file_path),
            cache_capacity: self.cache_capacity.unwrap_or(defaults.cache_capacity).max(1),
            embedding_dim: self.embedding_dim.unwrap_or(defaults.embedding_dim).max(1),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size).max(1),
            batch_flush: self
                .batch_flush_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_flush),
            sample_interval: self
                .sample_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sample_interval),
            mem_stop_pct: self.mem_stop_pct.unwrap_or(defaults.mem_stop_pct),
            mem_resume_pct: self.mem_resume_pct.unwrap_or(defaults.mem_resume_pct),
            cpu_stop_pct: self.cpu_stop_pct.unwrap_or(defaults.cpu_stop_pct),
            cpu_resume_pct: self.cpu_resume_pct.unwrap_or(defaults.cpu_resume_pct),
            worker_min,
            worker_max: self.worker_max.unwrap_or(defaults.worker_max).max(worker_min),
            worker_idle: self
                .worker_idle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.worker_idle),
            worker_min_life: self
                .worker_min_life_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.worker_min_life),
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            drain_grace: self
                .drain_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_grace),
            deferred_cap: self.deferred_cap.unwrap_or(defaults.deferred_cap),
            backend: self.backend.unwrap_or(defaults.backend),
            ..defaults
        }
    }
}

/// Fully-resolved runtime settings shared across the plane.
#[derive(Debug, Clone)]
pub struct Settings {
    pub model_cache_path: PathBuf,
    pub cache_file_path: PathBuf,
    pub cache_capacity: u32,
    pub embedding_dim: u32,
    pub batch_size: usize,
    pub batch_flush: Duration,
    pub sample_interval: Duration,
    pub mem_stop_pct: f32,
    pub mem_resume_pct: f32,
    pub cpu_stop_pct: f32,
    pub cpu_resume_pct: f32,
    pub worker_min: usize,
    pub worker_max: usize,
    pub worker_idle: Duration,
    pub worker_min_life: Duration,
    pub max_attempts: u32,
    pub drain_grace: Duration,
    /// Deferred-set cap while degraded
    pub deferred_cap: usize,
    /// Scheduler control-loop tick
    pub scheduler_tick: Duration,
    /// How long a fresh worker may sit in `starting` before another start is considered
    pub worker_warmup: Duration,
    /// Chunks per step when re-submitting deferred work after a resume
    pub drain_chunk_rate: usize,
    /// Worker command override (tests point this at the built binary)
    pub worker_program: Option<PathBuf>,
    /// Embedding backend workers load
    pub backend: String,
}

impl Default for Settings {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            model_cache_path: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("cinder/models"),
            cache_file_path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("cinder/emb.cache"),
            cache_capacity: 200_000,
            embedding_dim: 384,
            batch_size: 400,
            batch_flush: Duration::from_millis(50),
            sample_interval: Duration::from_millis(15_000),
            mem_stop_pct: 78.0,
            mem_resume_pct: 69.0,
            cpu_stop_pct: 69.0,
            cpu_resume_pct: 49.0,
            worker_min: 1,
            worker_max: cores.min(8),
            worker_idle: Duration::from_millis(300_000),
            worker_min_life: Duration::from_millis(600_000),
            max_attempts: 2,
            drain_grace: Duration::from_millis(10_000),
            deferred_cap: 100_000,
            scheduler_tick: Duration::from_secs(10),
            worker_warmup: Duration::from_secs(60),
            drain_chunk_rate: 256,
            worker_program: None,
            backend: if cfg!(feature = "onnx") {
                "onnx".to_string()
            } else {
                "hash".to_string()
            },
        }
    }
}

impl Settings {
    /// Heartbeat absence after which a worker is presumed dead.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.sample_interval * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_valid_config() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join(".cinder.toml");
        std::fs::write(&config_path, "batch_size = 128\nembedding_dim = 512\n").unwrap();

        let config = Config::load_file(&config_path).unwrap();
        assert_eq!(config.batch_size, Some(128));
        assert_eq!(config.embedding_dim, Some(512));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load_file(&dir.path().join("nonexistent.toml")).is_none());
    }

    #[test]
    fn test_load_malformed_toml() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join(".cinder.toml");
        std::fs::write(&config_path, "not valid [[[").unwrap();
        assert!(Config::load_file(&config_path).is_none());
    }

    #[test]
    fn test_merge_override() {
        let base = Config {
            batch_size: Some(100),
            embedding_dim: Some(384),
            ..Default::default()
        };
        let project = Config {
            batch_size: Some(200),
            worker_max: Some(2),
            ..Default::default()
        };

        let merged = base.override_with(project);
        assert_eq!(merged.batch_size, Some(200));
        assert_eq!(merged.embedding_dim, Some(384));
        assert_eq!(merged.worker_max, Some(2));
    }

    #[test]
    fn test_resolve_defaults() {
        let settings = Config::default().resolve();
        assert_eq!(settings.cache_capacity, 200_000);
        assert_eq!(settings.embedding_dim, 384);
        assert_eq!(settings.batch_size, 400);
        assert_eq!(settings.batch_flush, Duration::from_millis(50));
        assert_eq!(settings.max_attempts, 2);
        assert!(settings.worker_min >= 1);
        assert!(settings.worker_max >= settings.worker_min);
        assert!(settings.worker_max <= 8);
    }

    #[test]
    fn test_resolve_clamps_degenerate_values() {
        let config = Config {
            batch_size: Some(0),
            worker_min: Some(4),
            worker_max: Some(1),
            ..Default::default()
        };
        let settings = config.resolve();
        assert_eq!(settings.batch_size, 1);
        // worker_max never drops below worker_min
        assert_eq!(settings.worker_max, 4);
    }

    #[test]
    fn test_heartbeat_deadline_is_three_samples() {
        let settings = Config::default().resolve();
        assert_eq!(settings.heartbeat_deadline(), settings.sample_interval * 3);
    }
}
