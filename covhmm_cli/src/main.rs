#![allow(missing_docs)]

use clap::Parser;
use covhmm_cli::{Opts, Subcommand};
use std::process::{ExitCode, Termination};

fn main() -> ExitCode {
    let opts = Opts::parse();

    let level = if opts.configuration.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if opts.configuration.threads > 0 {
        if let Err(err) = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.configuration.threads)
            .build_global()
        {
            eprintln!("failed to size the thread pool: {err}");
            return ExitCode::FAILURE;
        }
    }

    match opts.subcommand.run(&opts.configuration) {
        Ok(code) => code,
        result @ Err(_) => result.report(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_command() {
        use clap::CommandFactory;
        Opts::command().debug_assert();
    }
}
