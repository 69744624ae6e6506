//! Outcome model: the result of one execution attempt.

/// What one `Command::execute` call produced.
///
/// Built once per attempt by the runner. Only `success` travels on to the
/// retry decision; output and error are consumed by logging and reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: Vec<u8>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn succeeded(output: Vec<u8>) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failed(output: Vec<u8>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output,
            error: Some(error.into()),
        }
    }

    /// Output as text, lossily decoded.
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}
