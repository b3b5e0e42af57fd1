use std::env;
use std::io::{stdout, BufWriter};
use std::process::exit;

use dram_utils::clock::CycleClock;
use log::error;
use rdma_channel::verbs::VerbsTransport;
use row_conflict::roles::receiver;
use row_conflict::{ExperimentConfig, ExperimentError, ReceiverArgs};

fn main() {
    env_logger::init();

    let setup = ReceiverArgs::from_args(env::args().skip(1))
        .and_then(|args| Ok((args, ExperimentConfig::from_env()?)))
        .map_err(ExperimentError::from);
    let (args, config) = match setup {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("receiver: {}", e);
            exit(1);
        }
    };
    let clock = CycleClock::calibrate(config.calibration_window);

    let mut out = BufWriter::new(stdout().lock());
    let result = VerbsTransport::new(config.verbs())
        .map_err(ExperimentError::from)
        .and_then(|mut transport| {
            receiver::run(&mut transport, &args, &config, &clock, &mut out)
        });
    if let Err(e) = result {
        error!("{}", e);
        eprintln!("receiver: {}", e);
        exit(1);
    }
}
