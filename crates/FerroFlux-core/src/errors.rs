//! Error and diagnostic types for the compile/execute/manage pipeline.

use thiserror::Error;

/// Fatal errors that propagate to the caller of `compile`, `run`/`async_run`,
/// or `acquire`/`acquire_sync`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("business '{0}' is not registered")]
    UnknownBusiness(String),

    #[error("cycle detected in graph: {0}")]
    CycleError(String),

    #[error(
        "compute failed in block '{block_name}' (instance '{instance_id}'): {source}"
    )]
    ComputeError {
        block_name: String,
        instance_id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl EngineError {
    pub fn compute(
        block_name: impl Into<String>,
        instance_id: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        EngineError::ComputeError {
            block_name: block_name.into(),
            instance_id: instance_id.into(),
            source: Box::new(source),
        }
    }
}

/// Non-fatal diagnostics absorbed by the compiler and logged rather than
/// returned as an error. Per spec §7: `UnknownBlock` and `DanglingConnection`
/// never fail compilation.
#[derive(Debug, Clone)]
pub enum CompileDiagnostic {
    UnknownBlock {
        node_id: String,
        block_type: String,
    },
    DanglingConnection {
        connection_id: String,
        from: String,
        to: String,
    },
}

impl std::fmt::Display for CompileDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileDiagnostic::UnknownBlock { node_id, block_type } => write!(
                f,
                "node '{node_id}' has unknown block type '{block_type}'; dropped"
            ),
            CompileDiagnostic::DanglingConnection { connection_id, from, to } => write!(
                f,
                "connection '{connection_id}' ({from} -> {to}) references an unresolved port; dropped"
            ),
        }
    }
}

/// The error a block's `on_compute`/`async_on_compute` returns. Blocks supply
/// their own cause; the executor wraps it with the failing instance's
/// identity before surfacing it as [`EngineError::ComputeError`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ComputeFailure(pub Box<dyn std::error::Error + Send + Sync>);

impl ComputeFailure {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ComputeFailure(Box::new(err))
    }

    pub fn msg(text: impl Into<String>) -> Self {
        ComputeFailure(Box::new(SimpleError(text.into())))
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct SimpleError(String);
