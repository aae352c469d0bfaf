//! Structured logging, injected as a capability rather than reached for as
//! a global (§9 "Global loggers"). Every binary calls [`init`] once at
//! startup; every library crate just uses `tracing`'s macros and never
//! touches a subscriber directly.

mod layer;
mod record;

pub use layer::JsonLayer;
pub use record::Record;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `json` selects machine-readable output
/// (one [`Record`] per line on stdout) suitable for an external log
/// pipeline; otherwise falls back to `tracing_subscriber`'s human-readable
/// formatter, which is what operators want at a terminal.
pub fn init(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        let layer = JsonLayer::new(|record: Record| {
            if let Ok(line) = serde_json::to_string(&record) {
                println!("{line}");
            }
        });
        tracing_subscriber::registry()
            .with(layer.with_filter(env_filter))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(env_filter)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn events_and_parent_spans_become_records() {
        let out: Arc<Mutex<Vec<Record>>> = Arc::new(Mutex::new(Vec::new()));
        let out_clone = out.clone();

        let _guard = tracing_subscriber::registry()
            .with(JsonLayer::new(move |record| out_clone.lock().unwrap().push(record)))
            .set_default();

        let span = tracing::info_span!("append_entries", term = 3u64);
        let _enter = span.enter();
        tracing::warn!(peer = "n2", "retrying rpc");

        let out = out.lock().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message, "retrying rpc");
        assert_eq!(out[0].fields.get("peer").unwrap(), "\"n2\"");
        assert_eq!(out[0].spans.len(), 1);
        assert_eq!(out[0].spans[0].message, "append_entries");
    }
}
