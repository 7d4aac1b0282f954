//! Build log interpretation.
//!
//! Turns the decoded message sequence of one build into a linear log and
//! classifies in-band errors as a terminal build failure.
//!
//! ```text
//! Streaming --stream--> Streaming
//! Streaming --error---> Failed   (terminal)
//! Streaming --finish--> Done     (terminal)
//! ```

use kiln_core::error::{KilnError, Result};
use kiln_core::message::BuildMessage;

/// Lifecycle of a [`BuildLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    Streaming,
    Failed,
    Done,
}

/// Accumulated log of a single build operation.
#[derive(Debug)]
pub struct BuildLog {
    text: String,
    state: LogState,
    image_id: Option<String>,
}

impl Default for BuildLog {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildLog {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            state: LogState::Streaming,
            image_id: None,
        }
    }

    /// Consume one message, in arrival order.
    ///
    /// Stream text is appended verbatim. An error payload moves the log to
    /// [`LogState::Failed`] and returns `BuildFailed` carrying everything
    /// accumulated so far, including stream text from the same message.
    /// Messages with neither field are ignored.
    pub fn feed(&mut self, message: BuildMessage) -> Result<()> {
        if self.state != LogState::Streaming {
            return Err(KilnError::InterpreterClosed);
        }

        if let Some(id) = message.image_id() {
            self.image_id = Some(id.to_string());
        }
        if let Some(status) = &message.status {
            tracing::debug!(status = %status, "Build status");
        }

        let failure = message.error_message();

        if let Some(text) = message.stream {
            self.text.push_str(&text);
        }

        if let Some(failure) = failure {
            self.state = LogState::Failed;
            tracing::warn!(error = %failure, "Engine reported build error");
            return Err(KilnError::BuildFailed {
                message: failure,
                partial_log: self.text.clone(),
            });
        }

        Ok(())
    }

    /// End of input without an error: return the complete log.
    pub fn finish(mut self) -> Result<String> {
        if self.state != LogState::Streaming {
            return Err(KilnError::InterpreterClosed);
        }
        self.state = LogState::Done;
        Ok(self.text)
    }

    /// Log text accumulated so far.
    pub fn log(&self) -> &str {
        &self.text
    }

    pub fn state(&self) -> LogState {
        self.state
    }

    /// Image id reported by the engine, once the image has been written.
    pub fn image_id(&self) -> Option<&str> {
        self.image_id.as_deref()
    }
}
