pub mod actor;
pub mod cluster;
pub mod domain;
pub mod index;
pub mod runtime;
pub mod storage;
pub mod workflow;

pub use domain::config;

pub use actor::{GrainError, GrainHandle};
pub use runtime::{Runtime, RuntimeBuilder};
