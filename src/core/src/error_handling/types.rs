use std::fmt;

use crate::lifecycle::InstanceState;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    MissingValue(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::MissingValue(e) => write!(f, "Missing configuration value: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Failures talking to the container engine.
#[derive(Debug)]
pub enum RuntimeError {
    /// The engine binary or its daemon socket cannot be reached.
    Unavailable(String),
    /// A runtime command ran but reported failure.
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    NotFound(String),
    Parse(String),
    IoError(std::io::Error),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Unavailable(e) => write!(f, "Container runtime not available: {}", e),
            RuntimeError::CommandFailed {
                command,
                status,
                stderr,
            } => match status {
                Some(code) => write!(f, "`{}` exited with {}: {}", command, code, stderr),
                None => write!(f, "`{}` was terminated: {}", command, stderr),
            },
            RuntimeError::NotFound(e) => write!(f, "Container not found: {}", e),
            RuntimeError::Parse(e) => write!(f, "Unable to parse runtime output: {}", e),
            RuntimeError::IoError(e) => write!(f, "Container IO error: {}", e),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            RuntimeError::Unavailable(err.to_string())
        } else {
            RuntimeError::IoError(err)
        }
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Parse(err.to_string())
    }
}

#[derive(Debug)]
pub enum ControlPlaneError {
    /// Network level failure, the panel could not be reached at all.
    Unreachable(String),
    Status { path: String, code: u16 },
    Decode(String),
}

impl fmt::Display for ControlPlaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlPlaneError::Unreachable(e) => write!(f, "Panel unreachable: {}", e),
            ControlPlaneError::Status { path, code } => {
                write!(f, "Panel answered {} with status {}", path, code)
            }
            ControlPlaneError::Decode(e) => write!(f, "Unable to decode panel response: {}", e),
        }
    }
}

impl std::error::Error for ControlPlaneError {}

#[derive(Debug)]
pub enum StreamError {
    /// Nothing is attached to the console.
    Detached,
    IoError(std::io::Error),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Detached => write!(f, "Console stream is not attached"),
            StreamError::IoError(e) => write!(f, "Console stream IO error: {}", e),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::IoError(err)
    }
}

/// Error returned by [`crate::lifecycle::StateMachine::transition_to`].
#[derive(Debug)]
pub enum TransitionError<S, E> {
    IllegalState { from: S, to: S },
    Action(E),
}

impl<S: fmt::Debug, E: fmt::Display> fmt::Display for TransitionError<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::IllegalState { from, to } => {
                write!(f, "Cannot transition to {:?} from state {:?}", to, from)
            }
            TransitionError::Action(e) => write!(f, "Transition action failed: {}", e),
        }
    }
}

impl<S: fmt::Debug, E: fmt::Debug + fmt::Display> std::error::Error for TransitionError<S, E> {}

#[derive(Debug)]
pub enum LifecycleError {
    IllegalState {
        from: InstanceState,
        to: InstanceState,
    },
    Runtime(RuntimeError),
    ControlPlane(ControlPlaneError),
    IoError(std::io::Error),
    NotFound(u32),
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::IllegalState { from, to } => {
                write!(f, "Illegal state change from {} to {}", from, to)
            }
            LifecycleError::Runtime(e) => write!(f, "Runtime error: {}", e),
            LifecycleError::ControlPlane(e) => write!(f, "Control plane error: {}", e),
            LifecycleError::IoError(e) => write!(f, "IO error: {}", e),
            LifecycleError::NotFound(id) => write!(f, "No instance with id {}", id),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<RuntimeError> for LifecycleError {
    fn from(err: RuntimeError) -> Self {
        LifecycleError::Runtime(err)
    }
}

impl From<ControlPlaneError> for LifecycleError {
    fn from(err: ControlPlaneError) -> Self {
        LifecycleError::ControlPlane(err)
    }
}

impl From<std::io::Error> for LifecycleError {
    fn from(err: std::io::Error) -> Self {
        LifecycleError::IoError(err)
    }
}

impl From<TransitionError<InstanceState, LifecycleError>> for LifecycleError {
    fn from(err: TransitionError<InstanceState, LifecycleError>) -> Self {
        match err {
            TransitionError::IllegalState { from, to } => LifecycleError::IllegalState { from, to },
            TransitionError::Action(e) => e,
        }
    }
}

#[derive(Debug)]
pub enum BootError {
    AlreadyBooting,
    ControlPlane(ControlPlaneError),
    Runtime(RuntimeError),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::AlreadyBooting => write!(f, "A boot sequence is already running"),
            BootError::ControlPlane(e) => write!(f, "Boot aborted, control plane error: {}", e),
            BootError::Runtime(e) => write!(f, "Boot aborted, runtime error: {}", e),
        }
    }
}

impl std::error::Error for BootError {}

impl From<ControlPlaneError> for BootError {
    fn from(err: ControlPlaneError) -> Self {
        BootError::ControlPlane(err)
    }
}

impl From<RuntimeError> for BootError {
    fn from(err: RuntimeError) -> Self {
        BootError::Runtime(err)
    }
}
