//! Prometheus gauges mirroring engine and tier statistics.
//!
//! Values are refreshed from the engine at scrape time.

use prometheus::{Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::engine::CacheEngine;

pub struct ServerMetrics {
    registry: Registry,
    hit_tokens: IntGauge,
    miss_tokens: IntGauge,
    hit_rate: Gauge,
    tier_bytes: IntGaugeVec,
    tier_chunks: IntGaugeVec,
}

impl ServerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let hit_tokens = IntGauge::new("kv_cache_hit_tokens", "Tokens served from the cache")?;
        let miss_tokens = IntGauge::new(
            "kv_cache_miss_tokens",
            "Requested tokens not found in the cache",
        )?;
        let hit_rate = Gauge::new("kv_cache_hit_rate", "hit_tokens / (hit_tokens + miss_tokens)")?;
        let tier_bytes = IntGaugeVec::new(
            Opts::new("kv_cache_tier_bytes_used", "Bytes resident per storage tier"),
            &["tier"],
        )?;
        let tier_chunks = IntGaugeVec::new(
            Opts::new("kv_cache_tier_chunks", "Chunks resident per storage tier"),
            &["tier"],
        )?;

        registry.register(Box::new(hit_tokens.clone()))?;
        registry.register(Box::new(miss_tokens.clone()))?;
        registry.register(Box::new(hit_rate.clone()))?;
        registry.register(Box::new(tier_bytes.clone()))?;
        registry.register(Box::new(tier_chunks.clone()))?;

        Ok(Self {
            registry,
            hit_tokens,
            miss_tokens,
            hit_rate,
            tier_bytes,
            tier_chunks,
        })
    }

    /// Refresh from `engine` and render the text exposition format.
    pub fn render(&self, engine: Option<&CacheEngine>) -> String {
        if let Some(engine) = engine {
            let stats = engine.stats();
            self.hit_tokens.set(stats.hit_tokens as i64);
            self.miss_tokens.set(stats.miss_tokens as i64);
            self.hit_rate.set(stats.hit_rate);
            for tier in engine.backend_stats() {
                let label = tier.tier.to_string();
                self.tier_bytes
                    .with_label_values(&[label.as_str()])
                    .set(tier.bytes_used as i64);
                self.tier_chunks
                    .with_label_values(&[label.as_str()])
                    .set(tier.chunk_count as i64);
            }
        }

        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_else(|e| format!("# Error encoding metrics: {e}"))
    }
}
