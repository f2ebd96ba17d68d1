//! Tunables for [`crate::manager::EngineManager`], loadable from the
//! process environment so deployments can size the cache/pool without a
//! rebuild.

use std::env;
use std::num::NonZeroUsize;

/// Bounds on the manager's blueprint cache and per-key instance pools.
#[derive(Debug, Clone)]
pub struct EngineManagerConfig {
    pub blueprint_cache_capacity: NonZeroUsize,
    pub pool_capacity_per_key: usize,
    pub worker_threads: usize,
}

impl Default for EngineManagerConfig {
    fn default() -> Self {
        EngineManagerConfig {
            blueprint_cache_capacity: NonZeroUsize::new(100).unwrap(),
            pool_capacity_per_key: 10,
            worker_threads: 4,
        }
    }
}

impl EngineManagerConfig {
    /// Overlays `FERROFLUX_BLUEPRINT_CACHE_CAPACITY`,
    /// `FERROFLUX_POOL_CAPACITY_PER_KEY`, and `FERROFLUX_WORKER_THREADS` on
    /// top of the defaults, ignoring unset or unparsable values.
    pub fn from_env() -> Self {
        let mut cfg = EngineManagerConfig::default();
        if let Some(v) = env_usize("FERROFLUX_BLUEPRINT_CACHE_CAPACITY") {
            if let Some(n) = NonZeroUsize::new(v) {
                cfg.blueprint_cache_capacity = n;
            }
        }
        if let Some(v) = env_usize("FERROFLUX_POOL_CAPACITY_PER_KEY") {
            cfg.pool_capacity_per_key = v;
        }
        if let Some(v) = env_usize("FERROFLUX_WORKER_THREADS") {
            cfg.worker_threads = v;
        }
        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
