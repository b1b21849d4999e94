//! isorun CLI entry point

use clap::Parser;

fn main() {
    let cli = isorun::cli::Cli::parse();

    // RUST_LOG wins; otherwise --verbose turns on debug logging for isorun
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_filter())),
        )
        .try_init();

    isorun::cli::run(cli);
}
