//! State-summary provider collaborator.

use serde_json::Value;

/// Produces the payload broadcast on every pulse.
///
/// Called synchronously from the node's pulse tick, so implementations must
/// return immediately. Slow work belongs in a separate task that updates
/// whatever state `summarize` reads.
pub trait StateProvider: Send + Sync {
    fn summarize(&self) -> Value;
}

impl<F> StateProvider for F
where
    F: Fn() -> Value + Send + Sync,
{
    fn summarize(&self) -> Value {
        self()
    }
}
