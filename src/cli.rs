//! Command-line surface (§6 "Process invocation").

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
  version,
  about = "Pre-forking cluster supervisor",
  long_about = None,
  bin_name = "prefork"
)]
pub struct Cli {
  /// Log level: off|error|warn|info|debug|trace. Falls back to `RUST_LOG`
  /// if set, then to `debug` (§6a).
  #[arg(short = 'l', long = "log")]
  pub log: Option<String>,

  /// Write logs to this file instead of stderr.
  #[arg(short = 'f', long = "file")]
  pub file: Option<PathBuf>,

  /// Number of workers to keep alive (default: CPU core count).
  #[arg(short = 'w', long = "workers")]
  pub workers: Option<usize>,

  /// Worker program to run.
  pub script: String,

  /// Arguments forwarded verbatim to every worker's command line, after `--`.
  #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
  pub worker_args: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_minimal_invocation() {
    let cli = Cli::parse_from(["prefork", "./worker.sh"]);
    assert_eq!(cli.script, "./worker.sh");
    assert!(cli.worker_args.is_empty());
    assert_eq!(cli.log, None);
  }

  #[test]
  fn parses_flags_and_trailing_args() {
    let cli = Cli::parse_from([
      "prefork", "-l", "info", "-w", "4", "./worker.sh", "--", "--port", "8080",
    ]);
    assert_eq!(cli.log.as_deref(), Some("info"));
    assert_eq!(cli.workers, Some(4));
    assert_eq!(cli.worker_args, vec!["--port", "8080"]);
  }
}
