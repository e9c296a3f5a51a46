//! Pyre client entry point.
//!
//! A short-lived, single-threaded front end for the analysis daemon:
//! parse the invocation, run exactly one operation, exit with a code
//! scripting callers can branch on (0 success, 2 client failure, 3
//! external build failure).
//!
//! ```text
//! pyre                 # incremental run (one-shot check without watchman)
//! pyre check           # one-shot check, no daemon
//! pyre start / stop    # daemon lifecycle
//! RUST_LOG=pyre_client=debug pyre restart
//! ```

use std::io;
use std::process;

use clap::Parser;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use pyre_client::Cli;

/// An interrupted run is not an analysis failure; report success so
/// wrapping scripts do not retry or alarm.
extern "C" fn handle_interrupt(_signal: libc::c_int) {
    unsafe {
        libc::_exit(pyre_core::ExitCode::Success.code());
    }
}

fn main() {
    let cli = Cli::parse();

    // All diagnostics go to stderr; stdout is reserved for operation
    // output (version report, query responses).
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(default_directive(&format!("pyre={level}")))
        .add_directive(default_directive(&format!("pyre_core={level}")))
        .add_directive(default_directive(&format!("pyre_client={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(!cli.noninteractive)
        .init();

    unsafe {
        libc::signal(
            libc::SIGINT,
            handle_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }

    let code = pyre_client::run(cli);
    process::exit(code.code());
}

// The directives are guaranteed to parse; the fallback only guards
// against a malformed level string.
fn default_directive(directive: &str) -> Directive {
    directive
        .parse()
        .unwrap_or_else(|_| Directive::from(tracing::Level::INFO))
}
