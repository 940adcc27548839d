//! Process-wide tracing setup.

use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber: a `LOG` env filter over a compact
/// stderr layer. Verbosity 0 = errors only, 1 = info, 2+ = debug.
///
/// Panics if a global subscriber was already installed.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();

    let fmt = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true);

    tracing_subscriber::registry().with(filter).with(fmt).init();
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}
