use prometheus_client::{
    metrics::{
        counter::Counter,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};

/// Metrics of the consensus state machine.
#[derive(Clone)]
pub struct Metrics {
    pub height: Gauge,
    pub rounds: Gauge,
    pub validators: Gauge,
    pub validators_power: Gauge,
    pub voters: Gauge,
    pub missing_validators: Gauge,
    pub byzantine_validators: Counter,
    pub block_interval_seconds: Histogram,
    pub num_txs: Gauge,
    pub total_txs: Counter,
    pub committed_height: Gauge,
    pub wal_writes: Counter,
}

impl Metrics {
    /// Creates the metrics and registers them in `registry`.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            height: Gauge::default(),
            rounds: Gauge::default(),
            validators: Gauge::default(),
            validators_power: Gauge::default(),
            voters: Gauge::default(),
            missing_validators: Gauge::default(),
            byzantine_validators: Counter::default(),
            block_interval_seconds: Histogram::new(exponential_buckets(0.1, 2.0, 10)),
            num_txs: Gauge::default(),
            total_txs: Counter::default(),
            committed_height: Gauge::default(),
            wal_writes: Counter::default(),
        };
        registry.register("height", "height of the chain", metrics.height.clone());
        registry.register(
            "rounds",
            "number of rounds at the current height",
            metrics.rounds.clone(),
        );
        registry.register(
            "validators",
            "number of validators",
            metrics.validators.clone(),
        );
        registry.register(
            "validators_power",
            "total voting power of the validators",
            metrics.validators_power.clone(),
        );
        registry.register("voters", "number of elected voters", metrics.voters.clone());
        registry.register(
            "missing_validators",
            "number of voters that did not sign the last block",
            metrics.missing_validators.clone(),
        );
        registry.register(
            "byzantine_validators",
            "number of conflicting votes observed",
            metrics.byzantine_validators.clone(),
        );
        registry.register(
            "block_interval_seconds",
            "time between this and the last block",
            metrics.block_interval_seconds.clone(),
        );
        registry.register(
            "num_txs",
            "number of transactions in the last block",
            metrics.num_txs.clone(),
        );
        registry.register(
            "total_txs",
            "number of committed transactions",
            metrics.total_txs.clone(),
        );
        registry.register(
            "committed_height",
            "height of the last committed block",
            metrics.committed_height.clone(),
        );
        registry.register(
            "wal_writes",
            "number of entries written to the WAL",
            metrics.wal_writes.clone(),
        );
        metrics
    }
}
