use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Configuration key or field that caused the error (e.g., "persona.system_prompt")
    pub field_path: Option<String>,
    /// Additional context about the error
    pub details: Option<String>,
    /// Component that raised the error (e.g., "http_provider", "dispatch_queue")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the relay.
///
/// Variants are grouped by how the pipeline reacts to them: provider and
/// transport failures feed the retry classifier, plugin failures are logged
/// and swallowed at the hook boundary, handler failures go back to the
/// dispatch queue.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Provider error: HTTP {status}: {message}")]
    Provider {
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Provider call timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("Network transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Plugin '{owner}' failed: {message}")]
    Plugin { owner: String, message: String },

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Handler error: {message}{}", format_context(.context))]
    Handler {
        message: String,
        context: ErrorContext,
    },

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Error::Handler {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn handler_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Handler {
            message: msg.into(),
            context,
        }
    }

    /// Build a provider error from an HTTP status. Only 5xx is transient.
    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        Error::Provider {
            status,
            message: message.into(),
            retryable: (500..=599).contains(&status),
        }
    }

    /// Whether a fresh attempt against the provider may succeed.
    ///
    /// Server-side failures, connection resets and timeouts are transient.
    /// Malformed requests, authentication failures and local errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider { retryable, .. } => *retryable,
            Error::Timeout { .. } => true,
            Error::Transport(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Handler { context, .. } => Some(context),
            _ => None,
        }
    }
}
