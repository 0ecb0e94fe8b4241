//! Logging setup for the supervisor binary.
//!
//! Follows the teacher's `env_logger::Builder::from_env(...).try_init()`
//! pattern (see `commands/daemon.rs`), but seeds the filter from the CLI's
//! `-l/--log` flag rather than solely from `RUST_LOG`, and optionally routes
//! output to a file so the worker pool's own stdout/stderr stay free for the
//! user's application (§6).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use env_logger::Target;
use log::LevelFilter;

/// Parse a level name, defaulting to `debug` for anything unrecognized.
pub fn parse_level(level: &str) -> LevelFilter {
  match level.to_ascii_lowercase().as_str() {
    "off" => LevelFilter::Off,
    "error" => LevelFilter::Error,
    "warn" => LevelFilter::Warn,
    "info" => LevelFilter::Info,
    "trace" => LevelFilter::Trace,
    _ => LevelFilter::Debug,
  }
}

/// Resolve the effective filter level: an explicit `-l/--log` flag wins,
/// otherwise `RUST_LOG` is consulted, otherwise `debug` (§6, §6a).
pub fn resolve_level(flag: Option<&str>) -> LevelFilter {
  if let Some(level) = flag {
    return parse_level(level);
  }
  if let Ok(from_env) = std::env::var("RUST_LOG") {
    return parse_level(&from_env);
  }
  LevelFilter::Debug
}

/// Initialize the global logger. Idempotent in practice: a second call
/// observes `try_init`'s error and is ignored, matching the teacher's
/// tolerance for re-entrant initialization in tests.
pub fn init(level: LevelFilter, file: Option<&Path>) {
  let mut builder = env_logger::Builder::new();
  builder.filter_level(level).format_timestamp_secs();

  if let Some(path) = file {
    if let Some(parent) = path.parent() {
      let _ = std::fs::create_dir_all(parent);
    }
    match OpenOptions::new().create(true).append(true).open(path) {
      Ok(handle) => {
        builder.target(Target::Pipe(Box::new(handle) as Box<dyn Write + Send + 'static>));
      }
      Err(err) => {
        eprintln!(
          "failed to open log file {}: {err}; logging to stderr instead",
          path.display()
        );
      }
    }
  }

  let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  fn parses_known_level_names() {
    assert_eq!(parse_level("warn"), LevelFilter::Warn);
    assert_eq!(parse_level("WARN"), LevelFilter::Warn);
    assert_eq!(parse_level("nonsense"), LevelFilter::Debug);
  }

  #[test]
  #[serial]
  fn explicit_flag_wins_over_rust_log() {
    unsafe { std::env::set_var("RUST_LOG", "error") };
    assert_eq!(resolve_level(Some("trace")), LevelFilter::Trace);
    unsafe { std::env::remove_var("RUST_LOG") };
  }

  #[test]
  #[serial]
  fn falls_back_to_rust_log_then_debug() {
    unsafe { std::env::remove_var("RUST_LOG") };
    assert_eq!(resolve_level(None), LevelFilter::Debug);

    unsafe { std::env::set_var("RUST_LOG", "warn") };
    assert_eq!(resolve_level(None), LevelFilter::Warn);
    unsafe { std::env::remove_var("RUST_LOG") };
  }
}
