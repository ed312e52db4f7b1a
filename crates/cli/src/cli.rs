use clap::builder::Styles;
use clap::builder::styling::AnsiColor;
use clap::{Parser, Subcommand};

/// Cargo-like help colors.
fn cli_styles() -> Styles {
	Styles::styled()
		.header(AnsiColor::Green.on_default().bold())
		.usage(AnsiColor::Green.on_default().bold())
		.literal(AnsiColor::Cyan.on_default())
		.placeholder(AnsiColor::Cyan.on_default())
		.valid(AnsiColor::Cyan.on_default())
}

#[derive(Parser, Debug)]
#[command(name = "dtx")]
#[command(about = "Mobile end-to-end session tooling")]
#[command(version)]
#[command(styles = cli_styles())]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Run a standalone control server until interrupted
	RunServer {
		/// Port to listen on (0 picks a free port)
		#[arg(short, long, default_value_t = 8099)]
		port: u16,

		/// Interface to bind
		#[arg(long, default_value = "127.0.0.1")]
		host: String,
	},
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_run_server_defaults() {
		let cli = Cli::try_parse_from(["dtx", "run-server"]).unwrap();

		let Commands::RunServer { port, host } = cli.command;
		assert_eq!(port, 8099);
		assert_eq!(host, "127.0.0.1");
		assert_eq!(cli.verbose, 0);
	}

	#[test]
	fn parse_run_server_with_port_and_verbosity() {
		let cli = Cli::try_parse_from(["dtx", "run-server", "--port", "0", "--host", "0.0.0.0", "-vv"]).unwrap();

		let Commands::RunServer { port, host } = cli.command;
		assert_eq!(port, 0);
		assert_eq!(host, "0.0.0.0");
		assert_eq!(cli.verbose, 2);
	}

	#[test]
	fn reject_out_of_range_port() {
		assert!(Cli::try_parse_from(["dtx", "run-server", "--port", "70000"]).is_err());
	}

	#[test]
	fn require_subcommand() {
		assert!(Cli::try_parse_from(["dtx"]).is_err());
	}
}
