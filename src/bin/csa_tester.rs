// CSA tester - Main Entry Point
//
// Measures synchronisation timing for a companion-screen application by
// acting as the TV device: serves the wall-clock, timeline and content-id
// protocols and samples the companion's light/audio output.

use clap::Parser;
use tracing::{error, info};

use synctiming_measurer::cancel::cancellation;
use synctiming_measurer::config::CsaTesterConfig;
use synctiming_measurer::error::{EXIT_FAIL, EXIT_PASS};
use synctiming_measurer::measurer::run_csa_measurement;

#[tokio::main]
async fn main() {
    let config = CsaTesterConfig::parse();
    synctiming_measurer::init_logging(config.common.verbose);

    info!("Starting CSA tester");

    let (cancel_source, cancel_token) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, aborting measurement");
            cancel_source.cancel();
        }
    });

    let code = match run_csa_measurement(config, cancel_token).await {
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
