//! Workspace logging.
//!
//! Two event families matter operationally and get their own targets so
//! they can be filtered apart: `cadence::internal` (task lifecycle and
//! wiring) and `cadence::sendpath` (per-row dispositions on the hot path,
//! where a misconfigured filter at scale means millions of lines an hour).
//! Everything else logs under its module path as usual.

use tracing_subscriber::EnvFilter;

/// Pipeline-internal events: task startup, shutdown, subsystem wiring.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::tracing::event!(
            target: "cadence::internal",
            $crate::tracing::Level::$level,
            $($arg)+
        )
    };

    ($($arg:tt)+) => {
        $crate::internal!(level = TRACE, $($arg)+)
    };
}

/// Events on the send path: claims, gates, skips, requeues, outcomes.
/// Defaults to DEBUG; at delivery volume these are the lines operators
/// turn on per incident, not permanently.
#[macro_export]
macro_rules! sendpath {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::tracing::event!(
            target: "cadence::sendpath",
            $crate::tracing::Level::$level,
            $($arg)+
        )
    };

    ($($arg:tt)+) => {
        $crate::sendpath!(level = DEBUG, $($arg)+)
    };
}

/// Crates whose events the default filter admits. Third-party noise
/// (hyper, sqlx query logs, redis) stays out unless asked for explicitly
/// through `LOG_LEVEL`.
const WORKSPACE_TARGETS: &[&str] = &[
    "cadence",
    "cadence_common",
    "cadence_delivery",
    "cadence_esp",
    "cadence_kv",
    "cadence_store",
    "cadence_throttle",
    "cadence_tracking",
];

fn default_directives() -> String {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    });

    WORKSPACE_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the process-wide subscriber.
///
/// `LOG_LEVEL` sets the level for every workspace target; full
/// `tracing` directive syntax also works there, e.g.
/// `LOG_LEVEL=warn,cadence::sendpath=trace` to watch only the hot path.
pub fn init() {
    let directives = std::env::var("LOG_LEVEL")
        .ok()
        .filter(|value| value.contains('='))
        .unwrap_or_else(default_directives);
    let filter = EnvFilter::try_new(&directives)
        .unwrap_or_else(|_| EnvFilter::new("cadence=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}
