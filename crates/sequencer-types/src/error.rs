/// The shared four-variant error taxonomy from §7. Component-level error
/// enums implement `kind()` to map onto this; `sequencer-core`'s client
/// boundary matches only on `kind()`, never on a component error's own
/// variants (§7a).
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Retried with bounded exponential backoff; surfaced to the client only
    /// if retries exhaust.
    Transient,
    /// Handled internally by RaftCore (step down, truncate, retry); never
    /// surfaced.
    Consistency,
    /// Returned synchronously to the client at admission.
    Validation,
    /// The node refuses to serve, requests re-sync, and raises an alarm.
    Fatal,
}
