// Copyright 2018 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! The engine's logging facade. Every crate logs through the `log` macros; this crate is the
//! only one that picks a backend, so a CLI entrypoint wires it up exactly once, and a library
//! embedding the engine may install its own subscriber instead.

use std::io::Write;
use std::str::FromStr;

use log::LevelFilter;
use parking_lot::Mutex;

/// Where a session's human-readable log lines should go, independent of the `log` crate's own
/// level filtering. Session & invalidation swaps this per-invocation so that a
/// `--log-file` CLI flag redirects console output without reconfiguring the global logger.
#[derive(Clone)]
pub enum Destination {
    Stderr,
    File(std::sync::Arc<Mutex<std::fs::File>>),
}

static DESTINATION: Mutex<Option<Destination>> = Mutex::new(None);

pub fn set_destination(destination: Destination) {
    *DESTINATION.lock() = Some(destination);
}

pub fn get_destination() -> Destination {
    DESTINATION.lock().clone().unwrap_or(Destination::Stderr)
}

/// Initializes the global `log` backend. Safe to call more than once; only the first call takes
/// effect, matching `env_logger`'s own idempotent `try_init`.
pub fn init(level: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        let destination = get_destination();
        let line = format!(
            "{} {:>5} {}: {}\n",
            chrono_free_timestamp(),
            record.level(),
            record.target(),
            record.args()
        );
        match destination {
            Destination::Stderr => write!(buf, "{line}"),
            Destination::File(file) => {
                let _ = file.lock().write_all(line.as_bytes());
                Ok(())
            }
        }
    });
    let _ = builder.try_init();
}

/// A monotonic-looking wall clock stamp without pulling in a dedicated time crate; this is a log
/// prefix, not a fingerprinted value, so it only needs to be readable, not precise.
fn chrono_free_timestamp() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}

/// Parses the CLI/options-layer level name (`"debug"`, `"warn"`, ...) into a `LevelFilter`,
/// matching the `options` scope's enum-option parsing so a bad `--level` value produces the same
/// class of diagnostic as any other malformed option.
pub fn parse_level(name: &str) -> Result<LevelFilter, String> {
    LevelFilter::from_str(name).map_err(|_| format!("not a valid log level: {name:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_accepts_standard_names() {
        assert_eq!(parse_level("info"), Ok(LevelFilter::Info));
        assert_eq!(parse_level("DEBUG"), Ok(LevelFilter::Debug));
    }

    #[test]
    fn parse_level_rejects_garbage() {
        assert!(parse_level("verbose-ish").is_err());
    }

    #[test]
    fn destination_defaults_to_stderr() {
        // Other tests in this process may have already set a destination; this only asserts
        // that fetching one never panics.
        let _ = get_destination();
    }
}
