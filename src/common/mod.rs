//! Common functionality.

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

pub mod io;

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Map the `log` level from the verbosity flags to a `tracing` level.
pub fn tracing_level(args: &Args) -> tracing::Level {
    match args.verbose.log_level() {
        Some(level) => match level {
            log::Level::Error => tracing::Level::ERROR,
            log::Level::Warn => tracing::Level::WARN,
            log::Level::Info => tracing::Level::INFO,
            log::Level::Debug => tracing::Level::DEBUG,
            log::Level::Trace => tracing::Level::TRACE,
        },
        None => tracing::Level::INFO,
    }
}

/// Return the version of the `beacon-loader` crate and `x.y.z` in tests.
pub fn worker_version() -> &'static str {
    if cfg!(test) {
        "x.y.z"
    } else {
        env!("CARGO_PKG_VERSION")
    }
}

#[cfg(test)]
mod test {
    #[test]
    fn worker_version_in_tests() {
        assert_eq!(super::worker_version(), "x.y.z");
    }

    #[rstest::rstest]
    #[case(0, 0, tracing::Level::INFO)]
    #[case(1, 0, tracing::Level::DEBUG)]
    #[case(2, 0, tracing::Level::TRACE)]
    #[case(0, 1, tracing::Level::WARN)]
    fn tracing_level(#[case] verbose: u8, #[case] quiet: u8, #[case] expected: tracing::Level) {
        let args = super::Args {
            verbose: clap_verbosity_flag::Verbosity::new(verbose, quiet),
        };
        assert_eq!(super::tracing_level(&args), expected);
    }
}
