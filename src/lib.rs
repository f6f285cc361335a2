
pub mod cancel;
pub mod clock;
pub mod config;
pub mod correlate;
pub mod detect;
pub mod dispersion;
pub mod error;
pub mod measurer;
pub mod metadata;
pub mod net;
pub mod report;
pub mod sampler;
pub mod translate;

/// Initialize logging subsystem. Shared by both tester binaries.
pub fn init_logging(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        tracing::info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
