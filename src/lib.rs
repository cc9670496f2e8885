#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod cell;
pub mod config;
mod core;
mod engine;
pub mod error;
pub mod lookup;
mod node;
pub mod provider;
pub mod retry;
pub mod stack;
pub mod transform;
mod utils;

pub use crate::blueprint::{Blueprint, LookupBinder, LookupDef, ResourceBinder, ResourceDef};
pub use crate::cell::{AnyCell, CellId, CellState, Inputs, ValueCell};
pub use crate::core::{ActionContext, ArcStr, Environment};
pub use crate::engine::{
    BranchFailure, Dispatcher, Edge, Execution, LookupReport, NodeReport, Orchestrator, Outcome, Report,
};
pub use crate::error::{Cause, CellError, Failure, KumoError, LookupError, NodeError};
pub use crate::node::{NodeState, ResourceNode};
pub use crate::retry::RetryPolicy;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
