use event_store::Lease;

/// Observable lifecycle notifications emitted by the orchestrator.
///
/// Reaction failures are never surfaced as errors to `drain` callers; blocked
/// streams are only visible here and through store-side state.
#[derive(Debug, Clone)]
pub enum Lifecycle {
    /// An event was committed through `execute`.
    Committed { stream: String, name: String, id: i64 },

    /// A stream's lease was acknowledged; its watermark advanced durably.
    Acked(Lease),

    /// A stream was blocked after exhausting its retry budget.
    Blocked(Lease),
}

/// Receives lifecycle notifications. Observers run synchronously on the
/// orchestrator's task and should return quickly.
pub trait LifecycleObserver: Send + Sync {
    fn notify(&self, event: &Lifecycle);
}

impl<F> LifecycleObserver for F
where
    F: Fn(&Lifecycle) + Send + Sync,
{
    fn notify(&self, event: &Lifecycle) {
        self(event)
    }
}
