//! Usage tracking.
//!
//! A background task appends JSON lines describing the host environment, the
//! engine configuration, and periodic uptime heartbeats to a local log. It
//! never shares mutable state with cache operations and all of its failures
//! are logged and dropped.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, EngineMetadata};

/// Default heartbeat period.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(120);

const VENDOR_FILES: &[&str] = &[
    "/sys/class/dmi/id/product_version",
    "/sys/class/dmi/id/bios_vendor",
    "/sys/class/dmi/id/product_name",
    "/sys/class/dmi/id/chassis_asset_tag",
    "/sys/class/dmi/id/sys_vendor",
];

const CLOUD_IDENTIFIERS: &[(&str, &str)] = &[
    ("amazon", "AWS"),
    ("microsoft corporation", "AZURE"),
    ("google", "GCP"),
    ("oraclecloud", "OCI"),
];

#[derive(Debug, Clone, Serialize)]
pub struct EnvMessage {
    pub provider: String,
    pub num_cpu: usize,
    pub architecture: &'static str,
    pub os: &'static str,
    /// Bytes, when `/proc/meminfo` is readable.
    pub total_memory: Option<u64>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineMessage {
    pub config: EngineConfig,
    pub model_name: String,
    pub world_size: usize,
    pub worker_id: usize,
    pub fmt: String,
    pub kv_dtype: String,
    pub kv_shape: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataMessage {
    /// Seconds since the Unix epoch at tracker start.
    pub start_time: u64,
    pub uptime_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum UsageMessage {
    Env(EnvMessage),
    Engine(EngineMessage),
    Metadata(MetadataMessage),
}

#[derive(Serialize)]
struct Envelope<'a> {
    session_id: Uuid,
    #[serde(flatten)]
    message: &'a UsageMessage,
}

/// Handle to the background usage task.
pub struct UsageTracker {
    session_id: Uuid,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl UsageTracker {
    /// Start tracking. Must be called from within a tokio runtime.
    pub fn spawn(
        config: &EngineConfig,
        metadata: &EngineMetadata,
        log_path: PathBuf,
        interval: Duration,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let engine = UsageMessage::Engine(EngineMessage {
            config: config.clone(),
            model_name: metadata.model_name.clone(),
            world_size: metadata.world_size,
            worker_id: metadata.worker_id,
            fmt: metadata.fmt.to_string(),
            kv_dtype: metadata.kv_dtype.as_str().to_string(),
            kv_shape: metadata.kv_shape.clone(),
        });
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let start_time = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();

            match tokio::task::spawn_blocking(track_env).await {
                Ok(env) => emit(&log_path, session_id, &UsageMessage::Env(env)).await,
                Err(e) => warn!(error = %e, "Environment detection failed"),
            }
            emit(&log_path, session_id, &engine).await;

            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let heartbeat = UsageMessage::Metadata(MetadataMessage {
                            start_time,
                            uptime_secs: started.elapsed().as_secs_f64(),
                        });
                        emit(&log_path, session_id, &heartbeat).await;
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!(%session_id, "Usage tracker stopped");
        });

        info!(%session_id, "Usage tracker started");
        Self {
            session_id,
            shutdown,
            handle,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Usage tracker task failed");
        }
    }
}

async fn emit(path: &Path, session_id: Uuid, message: &UsageMessage) {
    if let Err(e) = append_line(path, session_id, message).await {
        warn!(path = %path.display(), error = %e, "Failed to write usage message");
    }
}

async fn append_line(path: &Path, session_id: Uuid, message: &UsageMessage) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(&Envelope {
        session_id,
        message,
    })?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    Ok(())
}

fn track_env() -> EnvMessage {
    EnvMessage {
        provider: detect_provider(),
        num_cpu: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        architecture: std::env::consts::ARCH,
        os: std::env::consts::OS,
        total_memory: total_memory(),
        source: detect_source(),
    }
}

fn detect_provider() -> String {
    for file in VENDOR_FILES {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        let content = content.to_lowercase();
        for (needle, provider) in CLOUD_IDENTIFIERS {
            if content.contains(needle) {
                return provider.to_string();
            }
        }
    }
    if std::env::var_os("RUNPOD_DC_ID").is_some() {
        return "RUNPOD".to_string();
    }
    "UNKNOWN".to_string()
}

fn detect_source() -> String {
    match std::fs::read_to_string("/proc/1/cgroup") {
        Ok(cgroup) if cgroup.contains("docker") => "DOCKER".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

fn total_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}
