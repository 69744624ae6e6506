//! Command abstraction - one contract, two execution strategies.
//!
//! The strategy is chosen once at startup ([`CommandStrategy::into_factory`]).
//! Per delivery the factory only builds a value; every side effect lives in
//! [`Command::execute`].

mod http;
mod process;

use std::sync::Arc;

use async_trait::async_trait;

pub use self::http::{HttpCommand, HttpFactory};
pub use self::process::{ProcessCommand, ProcessFactory};

/// Why an execution attempt failed.
///
/// `output` is whatever was captured before the failure (possibly empty).
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program} exited with {status}")]
    ExitStatus {
        program: String,
        status: String,
        output: Vec<u8>,
    },

    #[error("{0}")]
    HttpStatus(String),

    #[error("request failed: {0}")]
    Network(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl CommandError {
    /// Output captured before the failure.
    pub fn output(&self) -> &[u8] {
        match self {
            CommandError::ExitStatus { output, .. } => output,
            _ => &[],
        }
    }
}

/// One execution attempt. Consumed by `execute`, so it runs at most once.
#[async_trait]
pub trait Command: Send {
    async fn execute(self: Box<Self>) -> Result<Vec<u8>, CommandError>;
}

/// Builds a [`Command`] from a payload. Must not perform I/O.
pub trait CommandFactory: Send + Sync {
    fn create(&self, payload: &[u8]) -> Box<dyn Command>;
}

/// Which execution strategy the worker runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStrategy {
    Process { program: String, args: Vec<String> },
    Http { url: String, content_type: String },
}

impl CommandStrategy {
    /// Split a command line such as `"php /srv/consume.php --env prod"` on
    /// whitespace into program and fixed arguments.
    pub fn process_from_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(CommandStrategy::Process {
            program,
            args: parts.collect(),
        })
    }

    pub fn into_factory(self) -> Result<Arc<dyn CommandFactory>, CommandError> {
        Ok(match self {
            CommandStrategy::Process { program, args } => {
                Arc::new(ProcessFactory::new(program, args))
            }
            CommandStrategy::Http { url, content_type } => {
                Arc::new(HttpFactory::new(url, content_type)?)
            }
        })
    }
}
