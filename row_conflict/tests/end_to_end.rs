use dram_utils::clock::MonotonicClock;
use dram_utils::dram_addressing::BankRowMapping;
use dram_utils::mmap::PageSize;
use rdma_channel::loopback::LoopbackFabric;
use row_conflict::config::{LISTEN_PORT, MESSAGE_BITS};
use row_conflict::roles::{intermediary, receiver, sender};
use row_conflict::{ExperimentConfig, IntermediaryArgs, LatencyTrace, ReceiverArgs, SenderArgs};
use spin_gate::SpinBudget;
use std::thread;
use std::time::{Duration, Instant};

fn config(seed: u64) -> ExperimentConfig {
    ExperimentConfig {
        region_unit: 1 << 20,
        pages: PageSize::Base,
        mapping: BankRowMapping::bit_window(7, 12),
        samples: 2000,
        tuning_trials: 50,
        tuning_warmup: 10,
        modulation_duration: Duration::from_millis(50),
        service_period: Duration::from_secs(5),
        thrash_size: 1 << 20,
        measurement_core: None,
        poller_core: None,
        sender_settle: Duration::ZERO,
        settle_before_reads: Duration::ZERO,
        settle_before_sampling: Duration::ZERO,
        calibration_window: Duration::ZERO,
        spin_budget: Some(SpinBudget(1 << 32)),
        seed: Some(seed),
        summary_warmup: 100,
        ..Default::default()
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(10), "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn three_roles_over_loopback() {
    let fabric = LoopbackFabric::new();
    let trace_path = std::env::temp_dir().join(format!(
        "row_conflict_e2e_{}.{}",
        std::process::id(),
        LatencyTrace::EXTENSION_ZSTD
    ));
    let config = ExperimentConfig {
        trace_path: Some(trace_path.clone()),
        ..config(17)
    };

    let mut server = fabric.endpoint();
    let intermediary = {
        let config = config.clone();
        thread::spawn(move || {
            let args = IntermediaryArgs::from_args(["2", "4", "1", "2"].map(String::from)).unwrap();
            intermediary::run(&mut server, &args, &config)
        })
    };
    wait_until("the intermediary to listen", || fabric.listening(LISTEN_PORT));

    let mut sender_transport = fabric.endpoint();
    let sender = {
        let config = config.clone();
        thread::spawn(move || {
            let args = SenderArgs::from_args(["localhost", "2", "4", "1"].map(String::from)).unwrap();
            sender::run(&mut sender_transport, &args, &config, &MonotonicClock::new())
        })
    };
    // Sender connections have to be the first ones the intermediary accepts.
    wait_until("the sender connections", || fabric.established() >= 2);

    let mut receiver_transport = fabric.endpoint();
    let args = ReceiverArgs::from_args(["localhost", "2"].map(String::from)).unwrap();
    let mut out = Vec::new();
    let trace = receiver::run(
        &mut receiver_transport,
        &args,
        &config,
        &MonotonicClock::new(),
        &mut out,
    )
    .unwrap()
    .unwrap();

    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), config.samples);
    assert!(lines.iter().all(|l| l.parse::<f64>().is_ok()));
    assert_eq!(trace.len(), config.samples);
    assert_eq!(LatencyTrace::read_msgpack_zstd(&trace_path).unwrap(), trace);
    std::fs::remove_file(&trace_path).unwrap();

    let sent = sender.join().unwrap().unwrap().unwrap();
    assert_eq!(sent.modulation.bursts, MESSAGE_BITS as u64 * sent.modulation.frames);
    // One signaled read per connection and burst.
    assert_eq!(
        sent.completions,
        2 * (config.tuning_trials as u64 + sent.modulation.bursts)
    );

    let served = intermediary.join().unwrap().unwrap().unwrap();
    assert_eq!(served.port, LISTEN_PORT);
    assert_eq!(served.sender_region, sent.region);
    assert_eq!(served.sender_region.length, 2 << 20);
    assert_eq!(served.receiver_region.length, 1 << 20);
    assert_eq!(fabric.established(), 4);
}

#[test]
fn sender_and_receiver_need_their_own_exchange() {
    // Two receiver style clients only: the intermediary publishes the first region after the
    // first connection, the second one at handshake completion.
    let fabric = LoopbackFabric::new();
    let config = ExperimentConfig {
        service_period: Duration::from_secs(1),
        ..config(3)
    };

    let mut server = fabric.endpoint();
    let intermediary = {
        let config = config.clone();
        thread::spawn(move || {
            let args = IntermediaryArgs::from_args(["1", "1", "1", "1"].map(String::from)).unwrap();
            intermediary::run(&mut server, &args, &config)
        })
    };
    wait_until("the intermediary to listen", || fabric.listening(LISTEN_PORT));

    let small = ExperimentConfig {
        samples: 100,
        ..config.clone()
    };
    let args = ReceiverArgs::from_args(["localhost", "1"].map(String::from)).unwrap();
    let first = {
        let mut transport = fabric.endpoint();
        let (args, small) = (args.clone(), small.clone());
        thread::spawn(move || {
            let mut out = Vec::new();
            receiver::run(&mut transport, &args, &small, &MonotonicClock::new(), &mut out)
                .map(|trace| trace.map(|t| t.len()))
        })
    };
    wait_until("the first connection", || fabric.established() >= 1);
    let mut transport = fabric.endpoint();
    let mut out = Vec::new();
    let second = receiver::run(&mut transport, &args, &small, &MonotonicClock::new(), &mut out)
        .unwrap()
        .unwrap();

    assert_eq!(second.len(), 100);
    assert_eq!(first.join().unwrap().unwrap(), Some(100));
    let served = intermediary.join().unwrap().unwrap().unwrap();
    assert_ne!(served.sender_region.rkey, served.receiver_region.rkey);
}
