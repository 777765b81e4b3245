// Simrun execution engine
//
// Turns resolved samples into an execution tree, runs one module instance
// per sample leaf on a fixed worker pool and drives optimizations over the
// leaves' result feedback.

pub mod aggregator;
pub mod config;
pub mod demo;
pub mod executor;
pub mod leaf;
pub mod optimization;
pub mod pool;
pub mod tree;
pub mod worker;

pub use aggregator::{GroupView, LeafView, ResultRow, ResultsAggregator};
pub use config::{EngineConfig, RunDescription};
pub use demo::{demo_registry, register_demo_modules, GaussianCalculator, ParabolaFitter};
pub use executor::{Executor, RunEvent, RunFinished, RunHandle};
pub use leaf::{leaf_channels, LeafHandle, LeafLink, StopSignal, WorkerEndpoints};
pub use optimization::{
    CoupledDriver, CoupledMember, DriverOptions, DriverState, SingleLeafDriver, SlotLayout,
};
pub use pool::{PoolStats, WorkerPool};
pub use tree::{
    build_plan, ExecutionNode, ExecutionPlan, ExecutionTree, LeafSpec, LeaveGroup, NodeId,
    NodeKind,
};
pub use worker::{run_worker, Stage, Worker, WorkerMode, WorkerSpec};
