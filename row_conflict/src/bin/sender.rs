use std::env;
use std::process::exit;

use dram_utils::clock::CycleClock;
use log::{error, info};
use rdma_channel::verbs::VerbsTransport;
use row_conflict::roles::sender;
use row_conflict::{ExperimentConfig, ExperimentError, SenderArgs};

fn main() {
    env_logger::init();

    let setup = SenderArgs::from_args(env::args().skip(1))
        .and_then(|args| Ok((args, ExperimentConfig::from_env()?)))
        .map_err(ExperimentError::from);
    let (args, config) = match setup {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("sender: {}", e);
            exit(1);
        }
    };
    let clock = CycleClock::calibrate(config.calibration_window);

    let result = VerbsTransport::new(config.verbs())
        .map_err(ExperimentError::from)
        .and_then(|mut transport| sender::run(&mut transport, &args, &config, &clock));
    match result {
        Ok(Some(report)) => info!(
            "done, {} bursts over {} frames at {:.2} ns",
            report.modulation.bursts, report.modulation.frames, report.period_ns
        ),
        Ok(None) => info!("done"),
        Err(e) => {
            error!("{}", e);
            eprintln!("sender: {}", e);
            exit(1);
        }
    }
}
