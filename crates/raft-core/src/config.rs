use std::time::Duration;

/// Tunables for the election/heartbeat timers and log-compaction threshold
/// (§4.6 "Election timeout is drawn uniformly from
/// [electionTimeoutMin, electionTimeoutMax] ... Heartbeat interval is ≪ min
/// election timeout").
#[derive(Clone, Copy, Debug)]
pub struct RaftConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub snapshot_threshold: u64,
    pub commit_timeout: Duration,
    pub peer_retry_backoff_initial: Duration,
    pub peer_retry_backoff_max: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            snapshot_threshold: 10_000,
            commit_timeout: Duration::from_secs(2),
            peer_retry_backoff_initial: Duration::from_millis(20),
            peer_retry_backoff_max: Duration::from_millis(500),
        }
    }
}
