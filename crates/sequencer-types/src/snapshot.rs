/// Point-in-time dump of applied state, used to bound log growth (§3
/// `Snapshot`). `StateReplication` is the sole owner of stamping
/// `last_included_index`/`last_included_term` (§4.7a); `StateStore::snapshot`
/// itself never sees these fields.
#[derive(Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub state_digest: [u8; 32],
    pub state_bytes: Vec<u8>,
}

/// Metadata describing one physical segment of the replication log
/// (§4.2a). The active segment has `last_index == lastIndex()`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LogSegmentMeta {
    pub segment_id: u64,
    pub first_index: u64,
    pub last_index: u64,
    pub size_bytes: u64,
}
