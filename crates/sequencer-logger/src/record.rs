use std::collections::BTreeMap;

/// One structured log record: a span or an event, flattened to the shape an
/// external log pipeline ingests (§1a). Field values are pre-serialized to
/// JSON strings so a record round-trips through `serde_json` without the
/// visitor needing to know each field's concrete type up front.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Record {
    pub ts_unix_ms: u128,
    pub level: String,
    pub message: String,
    pub fields: BTreeMap<String, String>,
    pub spans: Vec<Record>,
}

impl Record {
    pub(crate) fn empty(level: &tracing::Level, ts_unix_ms: u128) -> Self {
        Self {
            ts_unix_ms,
            level: level.as_str().to_ascii_lowercase(),
            message: String::new(),
            fields: BTreeMap::new(),
            spans: Vec::new(),
        }
    }
}
