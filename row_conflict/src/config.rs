use dram_utils::dram_addressing::{BankRowMapping, ADDRESS_GRANULARITY};
use dram_utils::mmap::PageSize;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rdma_channel::ConnParams;
use spin_gate::SpinBudget;
use std::ffi::OsString;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const LISTEN_PORT: u16 = 49999;
pub const GIB: usize = 1 << 30;
pub const SEED_VAR: &str = "ROW_CONFLICT_SEED";
pub const TRACE_VAR: &str = "ROW_CONFLICT_TRACE";

/// The message the sender modulates, 11 ones, sent least significant bit first.
pub const MESSAGE: u64 = 0b111_1111_1111;
pub const MESSAGE_BITS: usize = 11;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid {name} {value:?}: {source}")]
    Parse {
        name: &'static str,
        value: String,
        source: ParseIntError,
    },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("{reps} repetitions of {reads} reads leave no unique address")]
    Repetitions { reads: usize, reps: usize },
}

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub port: u16,
    pub resolve_timeout: Duration,
    pub conn_params: ConnParams,
    pub cq_depth: i32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub listen_backlog: i32,
    /// Bytes fetched by every one-sided read.
    pub read_size: u32,
    pub probe_interval_ns: u64,
    /// Issue this much before the probe interval is over, to absorb the post overhead.
    pub probe_slack_ns: u64,
    pub samples: usize,
    pub tuning_trials: usize,
    pub tuning_warmup: usize,
    pub message: u64,
    pub message_bits: usize,
    pub modulation_duration: Duration,
    pub service_period: Duration,
    pub measurement_core: Option<usize>,
    pub poller_core: Option<usize>,
    pub thrash_size: usize,
    pub granularity: u64,
    pub region_unit: usize,
    /// Addresses one region unit is expected to supply.
    pub addresses_per_unit: usize,
    pub pages: PageSize,
    pub mapping: BankRowMapping,
    pub sender_settle: Duration,
    pub settle_before_reads: Duration,
    pub settle_before_sampling: Duration,
    pub calibration_window: Duration,
    /// Bound on every spin-wait, `None` spins forever.
    pub spin_budget: Option<SpinBudget>,
    pub seed: Option<u64>,
    pub summary_warmup: usize,
    pub trace_path: Option<PathBuf>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            port: LISTEN_PORT,
            resolve_timeout: Duration::from_millis(500),
            conn_params: ConnParams::default(),
            cq_depth: 1000,
            max_send_wr: 100,
            max_recv_wr: 100,
            listen_backlog: 10,
            read_size: 64,
            probe_interval_ns: 500,
            probe_slack_ns: 100,
            samples: 1_000_000,
            tuning_trials: 5000,
            tuning_warmup: 1000,
            message: MESSAGE,
            message_bits: MESSAGE_BITS,
            modulation_duration: Duration::from_secs(10),
            service_period: Duration::from_secs(30),
            measurement_core: Some(2),
            poller_core: Some(4),
            thrash_size: 1 << 27,
            granularity: ADDRESS_GRANULARITY,
            region_unit: GIB,
            addresses_per_unit: 8,
            pages: PageSize::Huge1G,
            mapping: BankRowMapping::default(),
            sender_settle: Duration::from_secs(1),
            settle_before_reads: Duration::from_secs(1),
            settle_before_sampling: Duration::from_secs(4),
            calibration_window: Duration::from_secs(1),
            spin_budget: None,
            seed: None,
            summary_warmup: 1000,
            trace_path: None,
        }
    }
}

impl ExperimentConfig {
    /// Defaults, plus the seed and trace file taken from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var_os(name))
    }

    /// Defaults, plus the seed and trace file found through `lookup`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup(SEED_VAR) {
            let value = value.to_string_lossy().into_owned();
            let seed = value.trim().parse().map_err(|source| ConfigError::Parse {
                name: SEED_VAR,
                value: value.clone(),
                source,
            })?;
            config.seed = Some(seed);
        }
        config.trace_path = lookup(TRACE_VAR).map(PathBuf::from);
        Ok(config)
    }

    /// Size of a region able to supply `addresses` conflicting addresses, one spare unit included.
    pub fn region_size(&self, addresses: usize) -> usize {
        (addresses / self.addresses_per_unit + 1) * self.region_unit
    }

    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Wait between two probes, issue slack removed.
    pub fn probe_wait_ns(&self) -> u64 {
        self.probe_interval_ns.saturating_sub(self.probe_slack_ns)
    }

    #[cfg(feature = "verbs")]
    pub fn verbs(&self) -> rdma_channel::verbs::VerbsConfig {
        rdma_channel::verbs::VerbsConfig {
            cq_depth: self.cq_depth,
            max_send_wr: self.max_send_wr,
            max_recv_wr: self.max_recv_wr,
            listen_backlog: self.listen_backlog,
        }
    }
}

fn parse_count(name: &'static str, value: &str) -> Result<usize, ConfigError> {
    let n: usize = value.trim().parse().map_err(|source| ConfigError::Parse {
        name,
        value: value.to_owned(),
        source,
    })?;
    if n == 0 {
        return Err(ConfigError::Zero(name));
    }
    Ok(n)
}

fn collect_args<const N: usize>(
    args: impl IntoIterator<Item = String>,
    usage: &'static str,
) -> Result<[String; N], ConfigError> {
    let args: Vec<String> = args.into_iter().collect();
    args.try_into().map_err(|_| ConfigError::Usage(usage))
}

fn check_reps(reads: usize, reps: usize) -> Result<(), ConfigError> {
    if reads / reps == 0 {
        Err(ConfigError::Repetitions { reads, reps })
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediaryArgs {
    pub sender_qps: usize,
    pub sender_reads_per_qp: usize,
    pub sender_reps: usize,
    pub receiver_qps: usize,
}

impl IntermediaryArgs {
    pub const USAGE: &'static str =
        "intermediary <sender qps> <sender reads per qp> <sender repetitions> <receiver qps>";

    /// Parse the positional arguments, program name excluded.
    pub fn from_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let [a, b, c, d] = collect_args::<4>(args, Self::USAGE)?;
        let parsed = IntermediaryArgs {
            sender_qps: parse_count("sender qps", &a)?,
            sender_reads_per_qp: parse_count("sender reads per qp", &b)?,
            sender_reps: parse_count("sender repetitions", &c)?,
            receiver_qps: parse_count("receiver qps", &d)?,
        };
        check_reps(parsed.sender_qps * parsed.sender_reads_per_qp, parsed.sender_reps)?;
        Ok(parsed)
    }

    pub fn total_qps(&self) -> usize {
        self.sender_qps + self.receiver_qps
    }

    pub fn sender_unique_addresses(&self) -> usize {
        self.sender_qps * self.sender_reads_per_qp / self.sender_reps
    }

    /// The receiver issues one read per connection.
    pub fn receiver_addresses(&self) -> usize {
        self.receiver_qps
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderArgs {
    pub host: String,
    pub qps: usize,
    pub reads_per_qp: usize,
    pub reps: usize,
}

impl SenderArgs {
    pub const USAGE: &'static str = "sender <host> <qps> <reads per qp> <repetitions>";

    pub fn from_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let [host, a, b, c] = collect_args::<4>(args, Self::USAGE)?;
        let parsed = SenderArgs {
            host,
            qps: parse_count("qps", &a)?,
            reads_per_qp: parse_count("reads per qp", &b)?,
            reps: parse_count("repetitions", &c)?,
        };
        check_reps(parsed.total_reads(), parsed.reps)?;
        Ok(parsed)
    }

    pub fn total_reads(&self) -> usize {
        self.qps * self.reads_per_qp
    }

    pub fn unique_addresses(&self) -> usize {
        self.total_reads() / self.reps
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverArgs {
    pub host: String,
    pub qps: usize,
}

impl ReceiverArgs {
    pub const USAGE: &'static str = "receiver <host> <qps>";

    pub fn from_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let [host, a] = collect_args::<2>(args, Self::USAGE)?;
        Ok(ReceiverArgs {
            host,
            qps: parse_count("qps", &a)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn vars(list: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<OsString> {
        let list = list.to_vec();
        move |name| {
            list.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| OsString::from(*v))
        }
    }

    #[test]
    fn environment_overrides() {
        let c = ExperimentConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(c.seed, None);
        assert_eq!(c.trace_path, None);

        let c = ExperimentConfig::from_vars(vars(&[
            (SEED_VAR, " 42 "),
            (TRACE_VAR, "/tmp/trace.zst"),
        ]))
        .unwrap();
        assert_eq!(c.seed, Some(42));
        assert_eq!(c.trace_path, Some(PathBuf::from("/tmp/trace.zst")));

        match ExperimentConfig::from_vars(vars(&[(SEED_VAR, "-1")])) {
            Err(ConfigError::Parse { name, value, .. }) => {
                assert_eq!(name, SEED_VAR);
                assert_eq!(value, "-1");
            }
            other => panic!("{:?}", other.map(|c| c.seed)),
        }
    }

    #[test]
    fn intermediary_arguments() {
        let a = IntermediaryArgs::from_args(args(&["2", "4", "1", "2"])).unwrap();
        assert_eq!(a.total_qps(), 4);
        assert_eq!(a.sender_unique_addresses(), 8);
        assert_eq!(a.receiver_addresses(), 2);
        assert!(matches!(
            IntermediaryArgs::from_args(args(&["2", "4", "1"])),
            Err(ConfigError::Usage(_))
        ));
        assert!(matches!(
            IntermediaryArgs::from_args(args(&["2", "x", "1", "2"])),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn sender_arguments() {
        let s = SenderArgs::from_args(args(&["node1", "2", "4", "3"])).unwrap();
        assert_eq!(s.host, "node1");
        assert_eq!(s.total_reads(), 8);
        assert_eq!(s.unique_addresses(), 2);
        assert!(matches!(
            SenderArgs::from_args(args(&["node1", "1", "1", "2"])),
            Err(ConfigError::Repetitions { reads: 1, reps: 2 })
        ));
        assert!(matches!(
            SenderArgs::from_args(args(&["node1", "0", "1", "1"])),
            Err(ConfigError::Zero("qps"))
        ));
    }

    #[test]
    fn receiver_arguments() {
        let r = ReceiverArgs::from_args(args(&["10.0.0.1", "2"])).unwrap();
        assert_eq!(r.qps, 2);
        assert!(ReceiverArgs::from_args(args(&["10.0.0.1", "2", "3"])).is_err());
    }

    #[test]
    fn region_sizing() {
        let c = ExperimentConfig::default();
        assert_eq!(c.region_size(2), GIB);
        assert_eq!(c.region_size(8), 2 * GIB);
        assert_eq!(c.region_size(17), 3 * GIB);
        assert_eq!(c.probe_wait_ns(), 400);
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        use rand::Rng;
        let c = ExperimentConfig {
            seed: Some(42),
            ..Default::default()
        };
        let a: u64 = c.rng().gen();
        let b: u64 = c.rng().gen();
        assert_eq!(a, b);
    }
}
