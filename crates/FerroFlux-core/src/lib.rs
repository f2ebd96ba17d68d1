//! FerroFlux core: compiles schema graphs of typed compute blocks into
//! linear execution plans and runs them sequentially or in
//! dependency-parallel, behind a caching/pooling `EngineManager` so a
//! request-per-invocation caller can reuse compiled graphs cheaply.
//!
//! This crate is a library only — the HTTP surface, virtual filesystem,
//! schema persistence, block catalogue, dynamic block-source loading,
//! output-file bookkeeping, and chart rendering are external collaborators
//! that consume these types, not part of this crate.

pub mod block;
pub mod compiler;
pub mod config;
pub mod errors;
pub mod executor;
pub mod manager;
pub mod registry;
pub mod schema;

pub use block::{
    BlockConfig, BlockInstance, BlockSpec, BlockSpecBuilder, BlockTemplate, ComputeContext,
    GenericInstance, GenericInstanceIo, OptionDescriptor, OptionKind, OptionValue, Signal,
};
pub use compiler::{Compiler, Plan, Step, Transfer};
pub use config::EngineManagerConfig;
pub use errors::{CompileDiagnostic, ComputeFailure, EngineError};
pub use executor::{ExecutionReport, Executor};
pub use manager::{Blueprint, EngineManager, ManagerStats, ScopedEngine, ScopedEngineSync};
pub use registry::BlockRegistry;
pub use schema::{ConnectionSpec, NodeSpec, PortRef, Schema};
