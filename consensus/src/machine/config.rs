use std::time::Duration;

/// Configuration for the consensus state machine.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long to wait for a proposal in round 0 (and how much longer in each later round).
    pub timeout_propose: Duration,
    pub timeout_propose_delta: Duration,

    /// How long to wait after seeing two thirds of prevotes (for anything).
    pub timeout_prevote: Duration,
    pub timeout_prevote_delta: Duration,

    /// How long to wait after seeing two thirds of precommits (for anything).
    pub timeout_precommit: Duration,
    pub timeout_precommit_delta: Duration,

    /// How long to wait after committing a block before starting the next height (to
    /// gather more precommits for the last commit).
    pub timeout_commit: Duration,

    /// Start the next height as soon as every voter precommitted.
    pub skip_timeout_commit: bool,

    /// Propose blocks without transactions.
    pub create_empty_blocks: bool,

    /// When empty blocks are disabled, propose an empty block anyway after this long
    /// (zero to wait for transactions indefinitely).
    pub create_empty_blocks_interval: Duration,

    /// Maximum number of messages waiting in the mailbox.
    pub mailbox_size: usize,

    /// The storage partition of the write-ahead log.
    pub wal_partition: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_propose: Duration::from_millis(3_000),
            timeout_propose_delta: Duration::from_millis(500),
            timeout_prevote: Duration::from_millis(1_000),
            timeout_prevote_delta: Duration::from_millis(500),
            timeout_precommit: Duration::from_millis(1_000),
            timeout_precommit_delta: Duration::from_millis(500),
            timeout_commit: Duration::from_millis(1_000),
            skip_timeout_commit: false,
            create_empty_blocks: true,
            create_empty_blocks_interval: Duration::ZERO,
            mailbox_size: 1024,
            wal_partition: "consensus_wal".into(),
        }
    }
}

impl Config {
    /// Panics if the configuration can't drive consensus.
    pub fn assert(&self) {
        assert!(
            self.timeout_propose > Duration::ZERO,
            "propose timeout must be greater than zero"
        );
        assert!(
            self.timeout_prevote > Duration::ZERO,
            "prevote timeout must be greater than zero"
        );
        assert!(
            self.timeout_precommit > Duration::ZERO,
            "precommit timeout must be greater than zero"
        );
        assert!(self.mailbox_size > 0, "mailbox size must be greater than zero");
        assert!(
            !self.wal_partition.is_empty(),
            "WAL partition must not be empty"
        );
    }

    pub fn propose(&self, round: u32) -> Duration {
        self.timeout_propose + self.timeout_propose_delta * round
    }

    pub fn prevote(&self, round: u32) -> Duration {
        self.timeout_prevote + self.timeout_prevote_delta * round
    }

    pub fn precommit(&self, round: u32) -> Duration {
        self.timeout_precommit + self.timeout_precommit_delta * round
    }

    /// Time (milliseconds since the UNIX epoch) to start the height after a commit at `time`.
    pub fn commit(&self, time: u64) -> u64 {
        time + self.timeout_commit.as_millis() as u64
    }

    /// Configuration with short timeouts for tests.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            timeout_propose: Duration::from_millis(40),
            timeout_propose_delta: Duration::from_millis(1),
            timeout_prevote: Duration::from_millis(10),
            timeout_prevote_delta: Duration::from_millis(1),
            timeout_precommit: Duration::from_millis(10),
            timeout_precommit_delta: Duration::from_millis(1),
            timeout_commit: Duration::from_millis(10),
            skip_timeout_commit: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 3_000; "first round")]
    #[test_case(1, 3_500; "second round")]
    #[test_case(4, 5_000; "fifth round")]
    fn test_propose_timeout_grows_with_round(round: u32, expected: u64) {
        assert_eq!(
            Config::default().propose(round),
            Duration::from_millis(expected)
        );
    }

    #[test]
    fn test_default_is_valid() {
        let cfg = Config::default();
        cfg.assert();
        assert_eq!(cfg.prevote(2), Duration::from_millis(2_000));
        assert_eq!(cfg.precommit(0), Duration::from_millis(1_000));
        assert_eq!(cfg.commit(5), 1_005);
        Config::test().assert();
    }

    #[test]
    #[should_panic(expected = "mailbox size must be greater than zero")]
    fn test_rejects_empty_mailbox() {
        Config {
            mailbox_size: 0,
            ..Default::default()
        }
        .assert();
    }
}
