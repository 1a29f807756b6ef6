//! Tracing bootstrap and helpers for keeping secrets out of log output.

use std::fmt;

use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

/// Directives used when `RUST_LOG` is not set.
pub const DEFAULT_DIRECTIVES: &str = "agora_chat=debug,agora_store=info,warn";

/// Install the global `fmt` subscriber.
///
/// `RUST_LOG` wins over `default_directives`. Calling this more than once
/// (or after another subscriber was installed) does nothing.
pub fn init(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let _ = subscriber_fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Displays as `[REDACTED]` whatever it wraps.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_hides_value() {
        let pin = Redacted("1234");
        assert_eq!(format!("{pin}"), "[REDACTED]");
        assert_eq!(format!("{pin:?}"), "[REDACTED]");
    }

    #[test]
    fn init_twice_is_harmless() {
        init(DEFAULT_DIRECTIVES);
        init("trace");
    }
}
