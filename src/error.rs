//! Error taxonomy shared by the runtime, the containers and the registry.

use thiserror::Error;

use crate::container::ContainerStatus;
use crate::heap::RootId;

/// The managed runtime itself could not be created.
///
/// Terminal for every container that observes it: no retry is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("script engine failed to start: {reason}")]
pub struct EngineError {
    pub reason: String,
}

impl EngineError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A script raised an error, or a value could not cross the native boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("uncaught exception: {0}")]
    Runtime(String),

    #[error("value conversion failed: {0}")]
    Conversion(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Lookup miss in the heap value registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no rooted value for {0}")]
    NotFound(RootId),
}

/// Failure surfaced by a container operation before it is folded into `fail()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("operation not permitted while container is {status:?}")]
    InvalidState { status: ContainerStatus },
}
