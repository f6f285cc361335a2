// TV tester - Main Entry Point
//
// Measures synchronisation timing for a TV device by acting as a
// companion: connects to the TV's wall-clock and timeline endpoints,
// synchronises, and samples the TV's light/audio output.

use clap::Parser;
use tracing::{error, info};

use synctiming_measurer::cancel::cancellation;
use synctiming_measurer::config::TvTesterConfig;
use synctiming_measurer::error::{EXIT_FAIL, EXIT_PASS};
use synctiming_measurer::measurer::run_tv_measurement;

#[tokio::main]
async fn main() {
    let config = TvTesterConfig::parse();
    synctiming_measurer::init_logging(config.common.verbose);

    info!("Starting TV tester");
    info!("Timeline endpoint  : {}", config.ts_url);
    info!("Wall clock endpoint: {}", config.wc_url);

    let (cancel_source, cancel_token) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, aborting measurement");
            cancel_source.cancel();
        }
    });

    let code = match run_tv_measurement(config, cancel_token).await {
        Ok(outcome) => {
            if outcome.passed {
                EXIT_PASS
            } else {
                EXIT_FAIL
            }
        }
        Err(e) => {
            error!("Measurement failed: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
