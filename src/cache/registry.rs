//! Process-scoped store of cache engines keyed by instance id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::cache::engine::CacheEngine;
use crate::config::{EngineConfig, EngineMetadata};
use crate::error::{CacheError, Result};

/// Owns engine instances by id.
///
/// Creation happens under the registry lock, so callers racing on one id
/// observe a single instance.
#[derive(Default)]
pub struct CacheEngineRegistry {
    instances: Mutex<HashMap<String, Arc<CacheEngine>>>,
}

impl CacheEngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the engine registered under `instance_id`, creating it with the
    /// backend selected by `config` if absent.
    pub fn get_or_create(
        &self,
        instance_id: &str,
        config: EngineConfig,
        metadata: EngineMetadata,
    ) -> Result<Arc<CacheEngine>> {
        self.get_or_create_with(instance_id, config, metadata, CacheEngine::from_config)
    }

    /// Like [`get_or_create`](Self::get_or_create) with a custom constructor.
    pub fn get_or_create_with<F>(
        &self,
        instance_id: &str,
        config: EngineConfig,
        metadata: EngineMetadata,
        factory: F,
    ) -> Result<Arc<CacheEngine>>
    where
        F: FnOnce(EngineConfig, EngineMetadata) -> Result<CacheEngine>,
    {
        let mut instances = self.instances.lock();
        if let Some(engine) = instances.get(instance_id) {
            if engine.config() != &config || engine.metadata() != &metadata {
                return Err(CacheError::ConfigMismatch {
                    instance_id: instance_id.to_string(),
                });
            }
            return Ok(Arc::clone(engine));
        }

        let engine = Arc::new(factory(config, metadata)?);
        instances.insert(instance_id.to_string(), Arc::clone(&engine));
        info!(instance_id, "Registered cache engine");
        Ok(engine)
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<CacheEngine>> {
        self.instances.lock().get(instance_id).cloned()
    }

    /// Close and unregister an engine. No-op for unknown ids.
    pub fn destroy(&self, instance_id: &str) -> Result<()> {
        let Some(engine) = self.instances.lock().remove(instance_id) else {
            return Ok(());
        };
        if Arc::strong_count(&engine) > 1 {
            warn!(instance_id, "Destroying cache engine that is still referenced");
        }
        engine.close()?;
        info!(instance_id, "Destroyed cache engine");
        Ok(())
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
