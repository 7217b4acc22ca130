#![deny(rust_2018_idioms, clippy::disallowed_methods, clippy::disallowed_types)]
#![forbid(unsafe_code)]

pub mod level;
pub mod test;

use balpool_error::Error;
use tracing::Dispatch;
use tracing_subscriber::{
    filter::LevelFilter, prelude::*, registry::LookupSpan, reload, Layer, Registry,
};

pub use tracing::Subscriber;
pub use tracing_subscriber::{registry, EnvFilter};

const ENV_LOG_LEVEL: &str = "BALPOOL_LOG";
const ENV_LOG_FORMAT: &str = "BALPOOL_LOG_FORMAT";

const DEFAULT_LOG_LEVEL: &str = "warn,balpool=info";
const DEFAULT_LOG_FORMAT: &str = "PLAIN";

#[derive(Debug, Default)]
#[must_use]
pub struct Settings {
    filter: String,
    format: String,
    is_test: bool,
}

#[derive(Clone)]
pub struct Handle {
    level: Option<level::Handle>,
}

type FilteredRegistry =
    tracing_subscriber::layer::Layered<reload::Layer<EnvFilter, Registry>, Registry>;

#[inline]
pub(crate) fn update_max_level() {
    use tracing_log::{log, AsLog};
    log::set_max_level(LevelFilter::current().as_log());
}

pub fn init_log_compat() -> Result<(), Error> {
    tracing_log::LogTracer::init()?;
    // Set the initial max `log` level based on the subscriber settings.
    update_max_level();
    Ok(())
}

// === impl Settings ===

impl Settings {
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var(ENV_LOG_LEVEL)
                .ok()
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            format: std::env::var(ENV_LOG_FORMAT)
                .ok()
                .unwrap_or_else(|| DEFAULT_LOG_FORMAT.to_string()),
            is_test: false,
        }
    }

    fn for_test(filter: String, format: String) -> Self {
        Self {
            filter,
            format,
            is_test: true,
        }
    }

    fn mk_json<S>(&self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
        S: Send + Sync,
    {
        let fmt = tracing_subscriber::fmt::layer()
            .json()
            .with_thread_ids(!self.is_test)
            // Output the current span context as a JSON list.
            .with_span_list(true)
            // Don't output a field for the current span, since this
            // would duplicate information already in the span list.
            .with_current_span(false);
        if self.is_test {
            Box::new(fmt.with_test_writer())
        } else {
            Box::new(fmt)
        }
    }

    fn mk_plain<S>(&self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
        S: Send + Sync,
    {
        let fmt = tracing_subscriber::fmt::layer().with_thread_ids(!self.is_test);
        if self.is_test {
            Box::new(fmt.with_test_writer())
        } else {
            Box::new(fmt)
        }
    }

    /// Initialize tracing and logging with the value of the `BALPOOL_LOG`
    /// environment variable as the verbosity-level filter.
    pub fn init(self) -> Result<Handle, Error> {
        if self.filter.trim().eq_ignore_ascii_case("off") {
            return Ok(Handle::disabled());
        }

        let (dispatch, handle) = self.build();
        tracing::dispatcher::set_global_default(dispatch)?;
        init_log_compat()?;

        Ok(handle)
    }

    /// Builds a tracing dispatcher and a handle that can change the log
    /// level at runtime.
    pub fn build(self) -> (Dispatch, Handle) {
        // Invalid directives are reported on stderr and skipped.
        let filter = EnvFilter::builder().parse_lossy(&self.filter);
        let (filter, level) = reload::Layer::new(filter);

        let stdout = if self.format.eq_ignore_ascii_case("json") {
            self.mk_json::<FilteredRegistry>()
        } else {
            self.mk_plain::<FilteredRegistry>()
        };
        let registry = tracing_subscriber::registry().with(filter).with(stdout);

        let handle = Handle {
            level: Some(level::Handle::new(level)),
        };
        (registry.into(), handle)
    }
}

// === impl Handle ===

impl Handle {
    /// Returns a new `handle` with tracing disabled.
    pub fn disabled() -> Self {
        Self { level: None }
    }

    pub fn level(&self) -> Option<&level::Handle> {
        self.level.as_ref()
    }
}
