use std::path::PathBuf;
use std::sync::Once;

use tracing::{Dispatch, dispatcher};
use tracing_appender::rolling::daily;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub const LOG_FILE_PREFIX: &str = "plugin.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// `EnvFilter` directive, e.g. `info` or `backwards_invoke=debug,info`.
    pub level: String,
    /// Daily rolling files go here; stderr when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            dir: None,
        }
    }
}

/// Install the global subscriber once per process. Later calls are no-ops.
///
/// Output never goes to stdout: for local installs stdout carries the
/// protocol.
pub fn init(settings: &LogSettings) {
    static LOG_INIT: Once = Once::new();
    LOG_INIT.call_once(|| {
        let filter = build_filter(&settings.level);

        // ── file or stderr ─────────────────────────────────────────────
        let dispatch = match &settings.dir {
            Some(dir) => {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    eprintln!("cannot create log dir {}: {e}", dir.display());
                }
                Dispatch::new(
                    Registry::default().with(
                        fmt::layer()
                            .with_ansi(false)
                            .with_target(false)
                            .with_writer(daily(dir, LOG_FILE_PREFIX))
                            .with_filter(filter),
                    ),
                )
            }
            None => Dispatch::new(
                Registry::default().with(
                    fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr)
                        .with_filter(filter),
                ),
            ),
        };

        // ── install ────────────────────────────────────────────────────
        if dispatcher::set_global_default(dispatch).is_err() {
            eprintln!("a global tracing subscriber is already installed");
        }
    });
}

/// Falls back to `info` when the directive does not parse.
pub fn build_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|e| {
        eprintln!("invalid log filter {directive:?} ({e}), using info");
        EnvFilter::new("info")
    })
}
