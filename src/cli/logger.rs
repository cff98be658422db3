// Logging setup for the CLI

use log::LevelFilter;

/// Initialize the logger from the global verbosity flags.
///
/// The crate's own log level follows --verbose and --quiet; dependencies
/// stay one notch quieter because the HTTP stack is chatty at debug. A set
/// RUST_LOG overrides both flags, so dependency logs stay reachable
/// without a rebuild.
pub fn init_logger(verbose: bool, quiet: bool) {
    let (own_level, dependency_level) = if quiet {
        (LevelFilter::Error, LevelFilter::Error)
    } else if verbose {
        (LevelFilter::Debug, LevelFilter::Info)
    } else {
        (LevelFilter::Warn, LevelFilter::Warn)
    };

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(dependency_level)
        .filter_module("blazectl", own_level)
        .format_timestamp(None)
        .format_target(verbose);

    builder.parse_default_env();
    builder.init();
}
