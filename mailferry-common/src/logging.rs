//! Logging for the relay, built on `tracing`.
//!
//! A relayed connection is two conversations at once, so every wire
//! event is tagged with the leg it belongs to: client traffic goes to
//! the `mailferry::downstream` target, relay-target traffic to
//! `mailferry::upstream`, and engine lifecycle events to
//! `mailferry::engine`. A `dir` field distinguishes sent from received
//! lines. One connection's interleaved traffic can then be pulled apart
//! with ordinary filter directives, e.g. `mailferry::upstream=trace`.

use chrono::{SecondsFormat, Utc};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Rfc3339Time;

impl FormatTime for Rfc3339Time {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        w.write_fmt(format_args!(
            "{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        ))
    }
}

/// Wire traffic on the client-facing leg. The first token is the
/// direction, `recv` or `send`; an optional `level =` overrides the
/// TRACE default.
#[macro_export]
macro_rules! downstream {
    ($dir:ident, level = $level:ident, $($arg:tt)+) => {
        $crate::tracing::event!(
            target: "mailferry::downstream",
            $crate::tracing::Level::$level,
            dir = stringify!($dir),
            $($arg)+
        )
    };

    ($dir:ident, $($arg:tt)+) => {
        $crate::downstream!($dir, level = TRACE, $($arg)+)
    };
}

/// Wire traffic on the relay-target leg. Same shape as [`downstream!`].
#[macro_export]
macro_rules! upstream {
    ($dir:ident, level = $level:ident, $($arg:tt)+) => {
        $crate::tracing::event!(
            target: "mailferry::upstream",
            $crate::tracing::Level::$level,
            dir = stringify!($dir),
            $($arg)+
        )
    };

    ($dir:ident, $($arg:tt)+) => {
        $crate::upstream!($dir, level = TRACE, $($arg)+)
    };
}

/// Engine lifecycle: connections opened and closed, TLS upgrades,
/// backend failures.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::tracing::event!(
            target: "mailferry::engine",
            $crate::tracing::Level::$level,
            $($arg)+
        )
    };

    ($($arg:tt)+) => {
        $crate::internal!(level = TRACE, $($arg)+)
    };
}

/// Installs the global subscriber. A `RUST_LOG` directive wins when set;
/// otherwise the verbose flag decides between full wire tracing on both
/// legs and engine events only.
pub fn init(verbose: bool) {
    let fallback = if verbose {
        "mailferry=trace"
    } else {
        "mailferry=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(Rfc3339Time)
        .with_target(true)
        .init();
}
