//! `EngineManager`: compiles schemas into reusable [`Blueprint`]s, keyed by
//! a content hash of `(business_id, canonical schema)`, and lends out
//! [`Plan`] instances from a bounded per-key pool so repeated runs of the
//! same schema skip both recompilation and reallocation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use lru::LruCache;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::compiler::{node_option_overrides, Compiler, Plan, Step, Transfer};
use crate::config::EngineManagerConfig;
use crate::errors::{CompileDiagnostic, EngineError};
use crate::executor::{ExecutionReport, Executor};
use crate::registry::{option_value_from_json, BlockRegistry};
use crate::schema::Schema;

/// The cacheable, instance-free recipe for one compiled schema: everything
/// needed to spawn a fresh [`Plan`] without re-running cycle detection or
/// the topological sort.
struct NodeRecipe {
    node_id: String,
    block_type: String,
    options: std::collections::BTreeMap<String, serde_json::Value>,
    transfers: Vec<Transfer>,
    predecessors: Vec<usize>,
}

/// Observability snapshot returned by [`EngineManager::stats`].
#[derive(Debug, Clone, Copy)]
pub struct ManagerStats {
    pub blueprint_count: usize,
}

pub struct Blueprint {
    recipe: Vec<NodeRecipe>,
    diagnostics: Vec<CompileDiagnostic>,
    registry: Arc<BlockRegistry>,
}

impl Blueprint {
    fn from_plan(plan: Plan, schema: &Schema, registry: Arc<BlockRegistry>) -> Self {
        let nodes_by_id: std::collections::HashMap<_, _> =
            schema.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let recipe = plan
            .steps
            .into_iter()
            .map(|step| {
                let options = nodes_by_id
                    .get(step.node_id.as_str())
                    .zip(registry.get(&step.block_type))
                    .map(|(node, template)| node_option_overrides(node, template))
                    .unwrap_or_default();
                NodeRecipe {
                    options,
                    node_id: step.node_id,
                    block_type: step.block_type,
                    transfers: step.transfers,
                    predecessors: step.predecessors,
                }
            })
            .collect();
        Blueprint { recipe, diagnostics: plan.diagnostics, registry }
    }

    /// Instantiates a fresh, independent [`Plan`] from this recipe. Cheap
    /// relative to `Compiler::compile`: no graph algorithms run again, only
    /// each block's factory.
    pub fn spawn_plan(&self) -> Plan {
        let steps = self
            .recipe
            .iter()
            .map(|r| {
                let template = self
                    .registry
                    .get(&r.block_type)
                    .expect("recipe only references blocks present in its registry");
                let mut instance = template.spawn();
                instance.set_instance_id(r.node_id.clone());
                for (name, value) in &r.options {
                    if let Some(v) = option_value_from_json(value) {
                        instance.set_option(name, v);
                    }
                }
                Step {
                    node_id: r.node_id.clone(),
                    block_type: r.block_type.clone(),
                    instance,
                    transfers: r.transfers.clone(),
                    predecessors: r.predecessors.clone(),
                }
            })
            .collect();
        Plan { steps, diagnostics: self.diagnostics.clone() }
    }
}

struct ManagerInner {
    registries: DashMap<String, Arc<BlockRegistry>>,
    blueprint_cache: StdMutex<LruCache<String, Arc<Blueprint>>>,
    compile_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    pools: DashMap<String, StdMutex<VecDeque<Plan>>>,
    config: EngineManagerConfig,
    // Built lazily on first `acquire_sync` call, not at construction time:
    // most managers are only ever driven from the cooperative (`acquire`)
    // path, and an always-on worker-thread runtime would need special-cased
    // teardown (see `Drop` below) even when never used.
    sync_runtime: std::sync::OnceLock<tokio::runtime::Runtime>,
}

impl ManagerInner {
    fn sync_runtime(&self) -> &tokio::runtime::Runtime {
        self.sync_runtime.get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(self.config.worker_threads.max(1))
                .enable_all()
                .build()
                .expect("failed to build dedicated runtime for synchronous parallel execution")
        })
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        // Runtime::drop panics if invoked from within another runtime's
        // async context (e.g. the manager itself dropped inside a
        // `#[tokio::test]`). Tear it down on a plain OS thread instead.
        if let Some(rt) = self.sync_runtime.take() {
            let _ = std::thread::spawn(move || drop(rt)).join();
        }
    }
}

/// Content-addressed cache of compiled blueprints plus bounded object pools
/// of ready-to-run engines. Cheap to clone — internally an `Arc` — so it can
/// be shared across tasks/threads the way a singleton manager would be.
#[derive(Clone)]
pub struct EngineManager {
    inner: Arc<ManagerInner>,
}

impl EngineManager {
    pub fn new(config: EngineManagerConfig) -> Self {
        EngineManager {
            inner: Arc::new(ManagerInner {
                registries: DashMap::new(),
                blueprint_cache: StdMutex::new(LruCache::new(config.blueprint_cache_capacity)),
                compile_locks: DashMap::new(),
                pools: DashMap::new(),
                config,
                sync_runtime: std::sync::OnceLock::new(),
            }),
        }
    }

    pub fn with_default_config() -> Self {
        EngineManager::new(EngineManagerConfig::default())
    }

    /// Snapshot of cache occupancy for observability: how many blueprints
    /// are cached, and how many idle engines sit in `key`'s pool right now.
    /// Approximate under concurrent mutation — a read, not a lock held
    /// across the caller's use of it.
    pub fn stats(&self) -> ManagerStats {
        let blueprint_count = self.inner.blueprint_cache.lock().unwrap().len();
        ManagerStats { blueprint_count }
    }

    /// Number of idle engines currently sitting in `key`'s pool.
    pub fn pool_depth(&self, key: &str) -> usize {
        self.inner.pools.get(key).map(|p| p.lock().unwrap().len()).unwrap_or(0)
    }

    /// Registers (or replaces) the block library available to `business_id`.
    /// Templates already spawned from a prior registration keep running;
    /// only future compiles see the new set (§3 I4).
    pub fn register_business(&self, business_id: impl Into<String>, registry: BlockRegistry) {
        self.inner.registries.insert(business_id.into(), Arc::new(registry));
    }

    /// `blake3(business_id ++ ":" ++ canonical_json(schema))`, hex-encoded.
    /// Stronger than the checksum this replaces, and still cheap enough to
    /// recompute on every `acquire` call (§6 "Determinism").
    pub fn cache_key(business_id: &str, schema: &Schema) -> String {
        let payload = format!("{business_id}:{}", schema.canonical_json());
        blake3::hash(payload.as_bytes()).to_hex().to_string()
    }

    fn registry_for(&self, business_id: &str) -> Result<Arc<BlockRegistry>, EngineError> {
        self.inner
            .registries
            .get(business_id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::UnknownBusiness(business_id.to_string()))
    }

    /// Looks up a cached blueprint, compiling (and caching) on miss. Uses a
    /// per-key async lock so concurrent misses for the *same* key compile
    /// exactly once; misses on different keys proceed in parallel.
    #[instrument(skip(self, schema))]
    async fn blueprint_for(&self, business_id: &str, schema: &Schema) -> Result<(String, Arc<Blueprint>), EngineError> {
        let key = Self::cache_key(business_id, schema);

        if let Some(bp) = self.cached(&key) {
            return Ok((key, bp));
        }

        let lock = self
            .inner
            .compile_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(bp) = self.cached(&key) {
            return Ok((key, bp));
        }

        let registry = self.registry_for(business_id)?;
        let plan = Compiler::compile(schema, &registry)?;
        debug!(key = %key, diagnostics = plan.diagnostics.len(), "compiled new blueprint");
        let blueprint = Arc::new(Blueprint::from_plan(plan, schema, registry));
        self.inner.blueprint_cache.lock().unwrap().put(key.clone(), blueprint.clone());
        Ok((key, blueprint))
    }

    fn cached(&self, key: &str) -> Option<Arc<Blueprint>> {
        self.inner.blueprint_cache.lock().unwrap().get(key).cloned()
    }

    fn take_or_spawn(&self, key: &str, blueprint: &Blueprint) -> Plan {
        if let Some(pool) = self.inner.pools.get(key) {
            if let Some(plan) = pool.lock().unwrap().pop_front() {
                return plan;
            }
        }
        blueprint.spawn_plan()
    }

    fn return_plan(&self, key: &str, mut plan: Plan) {
        for step in &mut plan.steps {
            step.instance.reset();
        }
        let pool = self.inner.pools.entry(key.to_string()).or_insert_with(|| StdMutex::new(VecDeque::new()));
        let mut pool = pool.lock().unwrap();
        if pool.len() < self.inner.config.pool_capacity_per_key {
            pool.push_back(plan);
        }
    }

    /// Acquires a scoped engine for async callers. The returned guard owns
    /// a live [`Plan`], pulled from the pool if one is idle or spawned
    /// fresh from the blueprint otherwise, and returns it to the pool on
    /// drop.
    pub async fn acquire(&self, business_id: &str, schema: &Schema) -> Result<ScopedEngine, EngineError> {
        let (key, blueprint) = self.blueprint_for(business_id, schema).await?;
        let plan = self.take_or_spawn(&key, &blueprint);
        Ok(ScopedEngine { manager: self.clone(), key, plan: Some(plan) })
    }

    /// Acquires a scoped engine for synchronous callers, blocking the
    /// calling thread. `ScopedEngineSync::async_run` drives the cooperative
    /// parallel executor on a dedicated multi-thread runtime sized by
    /// `EngineManagerConfig::worker_threads`, so a blocking caller still
    /// gets true worker-pool parallelism rather than running single-threaded.
    pub fn acquire_sync(&self, business_id: &str, schema: &Schema) -> Result<ScopedEngineSync, EngineError> {
        let manager = self.clone();
        let business_id = business_id.to_string();
        let schema = schema.clone();
        let (key, blueprint) = self
            .inner
            .sync_runtime()
            .block_on(async move { manager.blueprint_for(&business_id, &schema).await })?;
        let plan = self.take_or_spawn(&key, &blueprint);
        Ok(ScopedEngineSync { manager: self.clone(), key, plan: Some(plan) })
    }
}

/// RAII handle to a pooled [`Plan`] acquired via [`EngineManager::acquire`].
/// Dropping it resets the instances and returns them to the pool.
pub struct ScopedEngine {
    manager: EngineManager,
    key: String,
    plan: Option<Plan>,
}

impl ScopedEngine {
    pub fn run(&mut self, cancellation: CancellationToken) -> ExecutionReport {
        Executor::run(self.plan.as_mut().expect("plan present while scope is live"), cancellation)
    }

    pub async fn async_run(&mut self, cancellation: CancellationToken) -> ExecutionReport {
        Executor::async_run(self.plan.as_mut().expect("plan present while scope is live"), cancellation).await
    }

    pub fn plan(&self) -> &Plan {
        self.plan.as_ref().expect("plan present while scope is live")
    }
}

impl Drop for ScopedEngine {
    fn drop(&mut self) {
        if let Some(plan) = self.plan.take() {
            self.manager.return_plan(&self.key, plan);
        }
    }
}

/// The blocking counterpart of [`ScopedEngine`], returned by
/// [`EngineManager::acquire_sync`].
pub struct ScopedEngineSync {
    manager: EngineManager,
    key: String,
    plan: Option<Plan>,
}

impl ScopedEngineSync {
    pub fn run(&mut self, cancellation: CancellationToken) -> ExecutionReport {
        Executor::run(self.plan.as_mut().expect("plan present while scope is live"), cancellation)
    }

    /// Blocks the calling thread while the plan runs to completion on the
    /// manager's dedicated parallel-execution runtime.
    pub fn async_run(&mut self, cancellation: CancellationToken) -> ExecutionReport {
        let mut plan = self.plan.take().expect("plan present while scope is live");
        let result = self
            .manager
            .inner
            .sync_runtime()
            .block_on(async { Executor::async_run(&mut plan, cancellation).await });
        self.plan = Some(plan);
        result
    }

    pub fn plan(&self) -> &Plan {
        self.plan.as_ref().expect("plan present while scope is live")
    }
}

impl Drop for ScopedEngineSync {
    fn drop(&mut self) {
        if let Some(plan) = self.plan.take() {
            self.manager.return_plan(&self.key, plan);
        }
    }
}
