use anyhow::Context;
use clap::Parser;
use prefork::cli::Cli;
use prefork::config::{default_worker_count, Config};
use prefork::logging;
use prefork::Supervisor;

fn main() -> anyhow::Result<()> {
  let cli = match Cli::try_parse() {
    Ok(cli) => cli,
    Err(e) if e.exit_code() == 0 => e.exit(),
    Err(e) => {
      eprintln!("{e}");
      std::process::exit(1);
    }
  };
  logging::init(
    logging::resolve_level(cli.log.as_deref()),
    cli.file.as_deref(),
  );

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()
    .context("failed to build tokio runtime")?;

  runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
  let worker_count = cli.workers.unwrap_or_else(default_worker_count);

  let mut worker_command = vec![cli.script];
  worker_command.extend(cli.worker_args);

  let config = Config::new(worker_command, worker_count);
  let supervisor = Supervisor::new(config).context("invalid configuration")?;

  supervisor.start().await.context("failed to start pool")?;
  log::info!("started {worker_count} worker(s)");

  prefork::signals::run_until_stop(supervisor).await;

  Ok(())
}
