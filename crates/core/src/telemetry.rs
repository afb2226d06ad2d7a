use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Dropping the returned guard flushes any buffered log lines. Keep it alive
/// for the lifetime of `main`.
pub struct LoggingGuard(#[allow(dead_code)] tracing_appender::non_blocking::WorkerGuard);

/// Installs a `tracing` subscriber writing to stderr.
///
/// `verbose` raises the default filter from `info` to `debug` for this
/// crate's own targets (it never affects dependency crates, which stay at
/// `warn` unless the caller sets `RUST_LOG` explicitly).
pub fn setup_logging(verbose: bool) -> LoggingGuard {
	let default_directive = if verbose {
		"warn,proxycheck=debug,proxycheck_core=debug"
	} else {
		"warn,proxycheck=info,proxycheck_core=info"
	};
	let filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

	let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_writer(non_blocking)
		.with_target(true)
		.with_span_events(FmtSpan::NONE);

	tracing_subscriber::registry()
		.with(filter)
		.with(fmt_layer)
		.init();

	LoggingGuard(guard)
}
