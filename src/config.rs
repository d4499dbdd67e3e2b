//! Runtime configuration for kv-blend-cache.
//!
//! Configuration can be loaded from a JSON file, from `KV_BLEND_*` environment
//! variables, or constructed programmatically. Field-wise equality of
//! [`EngineConfig`] and [`EngineMetadata`] gates engine reuse in the registry.

use std::path::{Path, PathBuf};

use candle_core::DType;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::codec::KvLayout;
use crate::error::{CacheError, Result};

/// Environment variable prefix for [`EngineConfig::from_env`].
pub const ENV_PREFIX: &str = "KV_BLEND_";

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-blend-cache", about = "Chunked KV-cache engine with cache blending")]
pub struct Cli {
    /// Path to configuration file (JSON). Falls back to environment variables when absent.
    #[arg(short, long, default_value = "kv-blend.json")]
    pub config: PathBuf,

    /// HTTP listen address for the admin API.
    #[arg(long, default_value = "0.0.0.0:8090")]
    pub listen: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Registry instance id of the engine served by this process.
    #[arg(long, default_value = "default")]
    pub instance_id: String,

    /// Model name used in cache keys.
    #[arg(long, default_value = "unknown-model")]
    pub model_name: String,

    /// Tensor-parallel world size.
    #[arg(long, default_value_t = 1)]
    pub world_size: usize,

    /// Tensor-parallel rank of this worker.
    #[arg(long, default_value_t = 0)]
    pub worker_id: usize,

    /// KV tensor layout: `vllm` or `huggingface`.
    #[arg(long, default_value = "vllm")]
    pub format: String,

    /// Append usage messages to this file.
    #[arg(long)]
    pub usage_log: Option<PathBuf>,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tokens per chunk, the unit of cache addressing.
    pub chunk_size: usize,

    /// Keep chunks in host RAM.
    pub local_cpu: bool,

    /// RAM budget in GB.
    pub max_local_cpu_size: f64,

    /// Directory for the on-disk tier.
    pub local_disk: Option<PathBuf>,

    /// Disk budget in GB.
    pub max_local_disk_size: f64,

    /// Remote store URL (`<scheme>://<host>:<port>`).
    pub remote_url: Option<String>,

    /// Remote serializer name.
    pub remote_serde: Option<String>,

    /// Whether KV produced during decoding should be stored.
    pub save_decode_cache: bool,

    /// Whether cache blending is enabled.
    pub enable_blending: bool,

    /// Fraction of valid positions recomputed during blending.
    pub blend_recompute_ratio: f64,

    /// Batches shorter than this are recomputed in full instead of blended.
    pub blend_min_tokens: usize,

    /// zstd level for the disk tier.
    pub disk_zstd_level: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            local_cpu: true,
            max_local_cpu_size: 5.0,
            local_disk: None,
            max_local_disk_size: 0.0,
            remote_url: None,
            remote_serde: None,
            save_decode_cache: false,
            enable_blending: false,
            blend_recompute_ratio: 0.15,
            blend_min_tokens: 256,
            disk_zstd_level: 3,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    ///
    /// A missing file yields the defaults overlaid with environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)
                .map_err(|e| CacheError::Config(format!("reading {}: {e}", path.display())))?;
            let config: EngineConfig = serde_json::from_str(&data)
                .map_err(|e| CacheError::Config(format!("parsing {}: {e}", path.display())))?;
            config.validated()
        } else {
            tracing::warn!("Config file not found at {:?}, using environment", path);
            Self::from_env()
        }
    }

    /// Preset configurations for the named local backends.
    pub fn from_legacy(chunk_size: usize, backend: &str) -> Result<Self> {
        let disk = PathBuf::from("/tmp/kv-blend-cache");
        let (local_cpu, local_disk, max_local_disk_size) = match backend {
            "cpu" => (true, None, 0.0),
            "local_disk" => (false, Some(disk), 5.0),
            "local_cpu_disk" => (true, Some(disk), 5.0),
            other => return Err(CacheError::Config(format!("invalid backend: {other}"))),
        };
        Self {
            chunk_size,
            local_cpu,
            local_disk,
            max_local_disk_size,
            ..Self::default()
        }
        .validated()
    }

    /// Defaults overwritten by `KV_BLEND_<FIELD>` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |field: &str| lookup(&format!("{ENV_PREFIX}{}", field.to_uppercase()));
        let mut config = Self::default();

        if let Some(v) = get("chunk_size") {
            config.chunk_size = parse_value("chunk_size", &v)?;
        }
        if let Some(v) = get("local_cpu") {
            config.local_cpu = parse_bool("local_cpu", &v)?;
        }
        if let Some(v) = get("max_local_cpu_size") {
            config.max_local_cpu_size = parse_value("max_local_cpu_size", &v)?;
        }
        if let Some(v) = get("local_disk") {
            config.local_disk = Some(PathBuf::from(v));
        }
        if let Some(v) = get("max_local_disk_size") {
            config.max_local_disk_size = parse_value("max_local_disk_size", &v)?;
        }
        if let Some(v) = get("remote_url") {
            config.remote_url = Some(v);
        }
        if let Some(v) = get("remote_serde") {
            config.remote_serde = Some(v);
        }
        if let Some(v) = get("save_decode_cache") {
            config.save_decode_cache = parse_bool("save_decode_cache", &v)?;
        }
        if let Some(v) = get("enable_blending") {
            config.enable_blending = parse_bool("enable_blending", &v)?;
        }
        if let Some(v) = get("blend_recompute_ratio") {
            config.blend_recompute_ratio = parse_value("blend_recompute_ratio", &v)?;
        }
        if let Some(v) = get("blend_min_tokens") {
            config.blend_min_tokens = parse_value("blend_min_tokens", &v)?;
        }
        if let Some(v) = get("disk_zstd_level") {
            config.disk_zstd_level = parse_value("disk_zstd_level", &v)?;
        }

        config.validated()
    }

    /// Check invariants and normalise `file://` disk locations to plain paths.
    pub fn validated(mut self) -> Result<Self> {
        if self.chunk_size == 0 {
            return Err(CacheError::Config("chunk_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.blend_recompute_ratio) {
            return Err(CacheError::Config(format!(
                "blend_recompute_ratio must be within [0, 1], got {}",
                self.blend_recompute_ratio
            )));
        }
        if let Some(disk) = self.local_disk.take() {
            let raw = disk.to_string_lossy();
            let path = match raw.strip_prefix("file://") {
                Some("") => return Err(CacheError::Config("empty local_disk path".into())),
                Some(rest) => PathBuf::from(rest),
                None => disk.clone(),
            };
            self.local_disk = Some(path);
        }
        if let Some(url) = &self.remote_url {
            if !is_valid_remote_url(url) {
                return Err(CacheError::Config(format!("invalid remote storage url: {url}")));
            }
        }
        Ok(self)
    }

    /// RAM budget in bytes.
    pub fn local_cpu_budget_bytes(&self) -> usize {
        gb_to_bytes(self.max_local_cpu_size)
    }

    /// Disk budget in bytes.
    pub fn local_disk_budget_bytes(&self) -> usize {
        gb_to_bytes(self.max_local_disk_size)
    }
}

/// Descriptor of the model and parallel rank an engine caches for.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineMetadata {
    pub model_name: String,
    pub world_size: usize,
    pub worker_id: usize,
    /// Tensor layout of the per-layer KV tensors.
    pub fmt: KvLayout,
    pub kv_dtype: DType,
    /// `[num_layers, 2, chunk_size, num_kv_heads, head_size]`, token and head axes
    /// swapped for huggingface.
    pub kv_shape: Vec<usize>,
}

impl EngineMetadata {
    pub fn new(
        model_name: impl Into<String>,
        world_size: usize,
        worker_id: usize,
        fmt: KvLayout,
        kv_dtype: DType,
        kv_shape: Vec<usize>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            world_size,
            worker_id,
            fmt,
            kv_dtype,
            kv_shape,
        }
    }
}

fn gb_to_bytes(gb: f64) -> usize {
    (gb.max(0.0) * 1024.0 * 1024.0 * 1024.0) as usize
}

fn parse_value<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| CacheError::Config(format!("{ENV_PREFIX}{}: {e}", field.to_uppercase())))
}

fn parse_bool(field: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CacheError::Config(format!(
            "{ENV_PREFIX}{}: expected a boolean, got {other:?}",
            field.to_uppercase()
        ))),
    }
}

/// `<scheme>://<host>:<port>` with a numeric port.
fn is_valid_remote_url(url: &str) -> bool {
    let Some((scheme, rest)) = url.split_once("://") else {
        return false;
    };
    let Some((host, port)) = rest.rsplit_once(':') else {
        return false;
    };
    !scheme.is_empty() && !host.is_empty() && port.parse::<u16>().is_ok()
}
