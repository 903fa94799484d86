//! Logging context and subscriber setup
//!
//! Components never configure logging themselves. Each one receives a
//! [`LogContext`] at construction and enters its span around every log call,
//! so records carry the component (and topic) they came from. Only the binary
//! installs a subscriber, through [`init_tracing`].

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Span handed to a component at construction
#[derive(Debug, Clone)]
pub struct LogContext {
    span: Span,
}

impl LogContext {
    pub fn new(component: &'static str) -> Self {
        Self {
            span: tracing::info_span!("taskpulse", component),
        }
    }

    /// Wrap a caller-supplied span (e.g. one carrying host identifiers)
    pub fn from_span(span: Span) -> Self {
        Self { span }
    }

    /// Nested context for a sub-component
    pub fn child(&self, component: &'static str) -> Self {
        let span = tracing::info_span!(parent: &self.span, "taskpulse", component);
        Self { span }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Run `f` inside this context
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        self.span.in_scope(f)
    }
}

/// `info` unless `directives` (a `RUST_LOG` value) parses; it may raise or
/// lower the level
fn level_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the process-wide subscriber (binary only)
///
/// `RUST_LOG` replaces the default `info` level. With `log_file` set, records
/// go to that file (truncated, no ANSI colors) instead of stderr.
pub fn init_tracing(log_file: Option<&Path>) -> std::io::Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = level_filter(rust_log.as_deref());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = File::create(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}
