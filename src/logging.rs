use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Initializes the global tracing subscriber.
///
/// `--verbose` raises the default level to debug, `RUST_LOG` overrides
/// everything, and `--json` switches the output to single-line JSON objects.
pub fn init(config: &Config) {
    let level = match config.verbose {
        true => Level::DEBUG,
        false => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("quinn=warn".parse().expect("static directive"))
        .add_directive("rustls=warn".parse().expect("static directive"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if config.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
