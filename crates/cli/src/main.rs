mod cli;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use dtx_runtime::{ControlServer, RelayServer, ServerOptions};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	if let Err(err) = dispatch(cli).await {
		eprintln!("error: {err:#}");
		std::process::exit(1);
	}
}

async fn dispatch(cli: Cli) -> Result<()> {
	match cli.command {
		Commands::RunServer { port, host } => run_server(host, port).await,
	}
}

async fn run_server(host: String, port: u16) -> Result<()> {
	let server = RelayServer::start(ServerOptions {
		host,
		port,
		standalone: true,
	})
	.await
	.context("failed to start control server")?;

	tokio::signal::ctrl_c()
		.await
		.context("failed to listen for ctrl-c")?;
	tracing::info!(target: "dtx::server", port = server.port(), "shutting down");

	server.close().await.context("failed to close control server")?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::logging::filter_for;

	#[test]
	fn verbosity_widens_filter() {
		assert_eq!(filter_for(0), "warn,dtx::server=info");
		assert_eq!(filter_for(1), "info");
		assert_eq!(filter_for(2), filter_for(5));
	}
}
