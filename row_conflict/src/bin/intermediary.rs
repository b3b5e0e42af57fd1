use std::env;
use std::process::exit;

use log::{error, info};
use rdma_channel::verbs::VerbsTransport;
use row_conflict::roles::intermediary;
use row_conflict::{ExperimentConfig, ExperimentError, IntermediaryArgs};

fn main() {
    env_logger::init();

    let setup = IntermediaryArgs::from_args(env::args().skip(1))
        .and_then(|args| Ok((args, ExperimentConfig::from_env()?)))
        .map_err(ExperimentError::from);
    let (args, config) = match setup {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("intermediary: {}", e);
            exit(1);
        }
    };

    let result = VerbsTransport::new(config.verbs())
        .map_err(ExperimentError::from)
        .and_then(|mut transport| intermediary::run(&mut transport, &args, &config));
    match result {
        Ok(Some(report)) => info!(
            "done, served {:#x} and {:#x} on port {}",
            report.sender_region.addr, report.receiver_region.addr, report.port
        ),
        Ok(None) => info!("done"),
        Err(e) => {
            error!("{}", e);
            eprintln!("intermediary: {}", e);
            exit(1);
        }
    }
}
