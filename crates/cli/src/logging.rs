use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Maps `-v` counts to a default filter; `RUST_LOG` wins when set.
pub fn filter_for(verbosity: u8) -> &'static str {
	// 0 = server lifecycle only, relay chatter suppressed
	// 1 (-v) = info everywhere
	// 2+ (-vv) = per-frame relay tracing
	match verbosity {
		0 => "warn,dtx::server=info",
		1 => "info",
		_ => "debug,dtx::server=trace",
	}
}

pub fn init_logging(verbosity: u8) {
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_for(verbosity)));

	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(stderr)
		.with_target(true)
		.with_level(true)
		.compact()
		.init();
}
