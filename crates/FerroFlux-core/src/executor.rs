//! Executes a compiled [`Plan`].
//!
//! Two strategies, both grounded directly in the two entry points of the
//! original engine:
//!
//! - [`Executor::run`] walks the plan's steps in topological order, one at
//!   a time — a plain sequential loop.
//! - [`Executor::async_run`] runs every step concurrently as soon as its
//!   predecessors have completed, using an atomic in-degree counter per
//!   step rather than waiting on each predecessor's individual completion
//!   signal — the counter form collapses what would otherwise be a
//!   fan-in wait into a single decrement-and-check, saving a task switch
//!   per non-ready node (DESIGN.md, "Counter-based fan-in").
//!
//! A step's own compute always runs through [`BlockInstance::on_compute`]
//! in `run`, and through [`BlockInstance::async_on_compute`] in
//! `async_run`. Blocks that haven't overridden the async path (the default
//! passthrough) are shuttled to the blocking-worker pool so one slow block
//! cannot stall the whole run; blocks that report [`BlockInstance::is_native_async`]
//! run inline on the cooperative scheduler instead, since their future is
//! already non-blocking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::block::{transfer_value, BlockInstance, ComputeContext};
use crate::compiler::Plan;
use crate::errors::{ComputeFailure, EngineError};

/// The outcome of one `run`/`async_run` call. `outcome` carries the first
/// compute failure encountered, if any, rather than the call itself
/// returning `Result` — a caller inspects one value whether the run
/// succeeded or failed partway through, the same shape spec.md's
/// execution-id framing describes for the RPC boundary this crate feeds.
#[derive(Debug)]
pub struct ExecutionReport {
    pub execution_id: Uuid,
    pub elapsed: Duration,
    pub outcome: Result<(), EngineError>,
}

pub struct Executor;

impl Executor {
    /// Runs every step once, strictly in the plan's topological order. The
    /// first block to fail aborts the run; no further step is computed.
    #[instrument(skip(plan), fields(execution_id))]
    pub fn run(plan: &mut Plan, cancellation: CancellationToken) -> ExecutionReport {
        let start = Instant::now();
        let execution_id = Uuid::new_v4();
        tracing::Span::current().record("execution_id", execution_id.to_string());

        let outcome = Self::run_steps(plan, execution_id, cancellation);
        ExecutionReport { execution_id, elapsed: start.elapsed(), outcome }
    }

    fn run_steps(
        plan: &mut Plan,
        execution_id: Uuid,
        cancellation: CancellationToken,
    ) -> Result<(), EngineError> {
        for step in 0..plan.steps.len() {
            if cancellation.is_cancelled() {
                debug!(step, "run cancelled before step");
                break;
            }
            let ctx = ComputeContext {
                instance_id: plan.steps[step].node_id.clone(),
                execution_id,
                cancellation: cancellation.clone(),
            };
            plan.steps[step].instance.on_compute(&ctx).map_err(|e| {
                EngineError::compute(plan.steps[step].block_type.clone(), ctx.instance_id.clone(), e)
            })?;

            // Topological order guarantees every transfer target lies
            // further along the plan, so this is safe without re-borrowing
            // the whole vector mutably at once.
            let outgoing: Vec<_> = plan.steps[step]
                .transfers
                .iter()
                .map(|t| (t.from_port.clone(), t.to_index, t.to_port.clone()))
                .collect();
            for (from_port, to_index, to_port) in outgoing {
                if let Some(value) = plan.steps[step].instance.get_output(&from_port).cloned() {
                    transfer_value(plan.steps[to_index].instance.as_mut(), &to_port, value);
                }
            }
        }

        Ok(())
    }

    /// Runs every step concurrently as soon as it becomes ready. Each
    /// step's in-degree is tracked with an [`AtomicUsize`]; a step spawns
    /// its compute the moment its counter reaches zero. Cancellation is
    /// checked both before a step starts and is honored cooperatively by
    /// any block that reads `ctx.cancellation` itself.
    #[instrument(skip(plan), fields(execution_id))]
    pub async fn async_run(plan: &mut Plan, cancellation: CancellationToken) -> ExecutionReport {
        let start = Instant::now();
        let execution_id = Uuid::new_v4();
        tracing::Span::current().record("execution_id", execution_id.to_string());

        let outcome = Self::run_steps_parallel(plan, execution_id, cancellation).await;
        ExecutionReport { execution_id, elapsed: start.elapsed(), outcome }
    }

    async fn run_steps_parallel(
        plan: &mut Plan,
        execution_id: Uuid,
        cancellation: CancellationToken,
    ) -> Result<(), EngineError> {
        let n = plan.steps.len();

        // Successor lists, derived from transfers, are what actually
        // drives the schedule: when a step finishes it decrements each
        // successor's counter itself, and only the predecessor that drives
        // a counter to zero wakes that successor — every other predecessor
        // finishing is a silent decrement, not a broadcast.
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (idx, step) in plan.steps.iter().enumerate() {
            for t in &step.transfers {
                if !successors[idx].contains(&t.to_index) {
                    successors[idx].push(t.to_index);
                }
            }
        }
        let successors = Arc::new(successors);

        let in_degree: Arc<Vec<AtomicUsize>> = Arc::new(
            plan.steps.iter().map(|s| AtomicUsize::new(s.predecessors.len())).collect(),
        );
        let ready = Arc::new((0..n).map(|_| Notify::new()).collect::<Vec<_>>());
        let first_error: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));

        // Each instance is wrapped so the executor can temporarily take
        // ownership for spawn_blocking offload, then hand it back — a
        // `&mut self` method call can't cross into an owned 'static
        // closure, so the slot gives us an owned value to move instead.
        let slots: Vec<Arc<Mutex<Option<Box<dyn BlockInstance>>>>> = plan
            .steps
            .iter_mut()
            .map(|s| {
                Arc::new(Mutex::new(Some(std::mem::replace(
                    &mut s.instance,
                    crate::block::noop_instance(),
                ))))
            })
            .collect();

        let transfers: Arc<Vec<Vec<(String, usize, String)>>> = Arc::new(
            plan.steps
                .iter()
                .map(|s| {
                    s.transfers
                        .iter()
                        .map(|t| (t.from_port.clone(), t.to_index, t.to_port.clone()))
                        .collect()
                })
                .collect(),
        );
        let names: Arc<Vec<(String, String)>> = Arc::new(
            plan.steps
                .iter()
                .map(|s| (s.node_id.clone(), s.block_type.clone()))
                .collect(),
        );

        let mut handles = Vec::with_capacity(n);
        for idx in 0..n {
            let successors = successors.clone();
            let in_degree = in_degree.clone();
            let ready = ready.clone();
            let slots = slots.clone();
            let transfers = transfers.clone();
            let names = names.clone();
            let first_error = first_error.clone();
            let cancellation = cancellation.clone();

            handles.push(tokio::spawn(async move {
                if in_degree[idx].load(Ordering::Acquire) != 0 {
                    ready[idx].notified().await;
                }

                if cancellation.is_cancelled() || first_error.lock().await.is_some() {
                    signal_successors(idx, &successors, &in_degree, &ready);
                    return;
                }

                let (node_id, block_type) = names[idx].clone();
                let ctx = ComputeContext {
                    instance_id: node_id.clone(),
                    execution_id,
                    cancellation: cancellation.clone(),
                };

                let mut instance =
                    slots[idx].lock().await.take().expect("instance present exactly once per step");

                let is_native = instance.is_native_async();
                let result = if is_native {
                    instance.async_on_compute(&ctx).await
                } else {
                    let ctx_owned = ctx.clone();
                    match tokio::task::spawn_blocking(move || {
                        let r = instance.on_compute(&ctx_owned);
                        (instance, r)
                    })
                    .await
                    {
                        Ok((returned, r)) => {
                            instance = returned;
                            r
                        }
                        Err(join_err) => {
                            warn!(%join_err, node_id = node_id.as_str(), "blocking compute task panicked");
                            // The real instance was moved into the panicked
                            // task and is gone with it; leave a placeholder
                            // in its slot and surface the panic as a compute
                            // failure for this step.
                            instance = crate::block::noop_instance();
                            Err(ComputeFailure::msg(join_err.to_string()))
                        }
                    }
                };

                match result {
                    Err(e) => {
                        let err = EngineError::compute(block_type, node_id.clone(), e);
                        let mut slot = first_error.lock().await;
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                    Ok(()) => {
                        for (from_port, to_index, to_port) in &transfers[idx] {
                            if let Some(value) = instance.get_output(from_port).cloned() {
                                let mut downstream = slots[*to_index].lock().await;
                                if let Some(dst) = downstream.as_mut() {
                                    transfer_value(dst.as_mut(), to_port, value);
                                }
                            }
                        }
                    }
                }

                *slots[idx].lock().await = Some(instance);
                debug!(node_id, "step complete");
                signal_successors(idx, &successors, &in_degree, &ready);
            }));
        }

        for h in handles {
            let _ = h.await;
        }

        for (idx, slot) in slots.into_iter().enumerate() {
            plan.steps[idx].instance = slot.lock().await.take().expect("instance returned by its task");
        }

        if let Some(err) = first_error.lock().await.take() {
            return Err(err);
        }

        Ok(())
    }
}

/// Decrements the counter of every successor of `idx`; the predecessor
/// whose decrement drives a counter to zero is the one that wakes it, so a
/// step is woken exactly once regardless of how many predecessors it has.
fn signal_successors(
    idx: usize,
    successors: &[Vec<usize>],
    in_degree: &[AtomicUsize],
    ready: &[Notify],
) {
    for &succ in &successors[idx] {
        if in_degree[succ].fetch_sub(1, Ordering::AcqRel) == 1 {
            ready[succ].notify_one();
        }
    }
}

