//! Scoped logging facade over `tracing`.
//!
//! Every service, controller and scheduler gets a logger scoped to its type
//! name via [`Logger::extend`], so log lines carry the component that emitted
//! them without each call site repeating it.

/// A leveled logger carrying a scope name.
#[derive(Clone, Debug)]
pub struct Logger {
    scope: String,
}

impl Logger {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }

    /// Derive a logger with a nested scope, e.g. `APP` -> `APP:EchoService`.
    pub fn extend(&self, name: &str) -> Logger {
        Logger {
            scope: format!("{}:{}", self.scope, name),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn debug(&self, msg: impl std::fmt::Display) {
        tracing::debug!(scope = %self.scope, "{msg}");
    }

    pub fn info(&self, msg: impl std::fmt::Display) {
        tracing::info!(scope = %self.scope, "{msg}");
    }

    pub fn warn(&self, msg: impl std::fmt::Display) {
        tracing::warn!(scope = %self.scope, "{msg}");
    }

    pub fn error(&self, msg: impl std::fmt::Display) {
        tracing::error!(scope = %self.scope, "{msg}");
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("APP")
    }
}
