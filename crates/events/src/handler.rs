use crate::EventEnvelope;

/// What a handler wants done with the delivery it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed; record it and commit.
    Ack,
    /// Transient failure; try again (bounded by the dispatcher's retry policy).
    Retry(String),
    /// Permanent failure; skip remaining retries and dead-letter now.
    DeadLetter(String),
}

impl HandlerOutcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry(reason.into())
    }

    pub fn dead_letter(reason: impl Into<String>) -> Self {
        Self::DeadLetter(reason.into())
    }
}

/// Consumer-side business logic for one event type.
///
/// Delivery is at-least-once. The dispatcher suppresses duplicates it can
/// see, but a handler must still be safe to run twice for the same envelope
/// (e.g. after a crash between handler success and the idempotency write).
/// Handlers block their partition while running, so they should bound their
/// own IO with timeouts.
pub trait EventHandler: Send + Sync {
    fn handle(&self, envelope: &EventEnvelope) -> HandlerOutcome;
}

impl<F> EventHandler for F
where
    F: Fn(&EventEnvelope) -> HandlerOutcome + Send + Sync,
{
    fn handle(&self, envelope: &EventEnvelope) -> HandlerOutcome {
        self(envelope)
    }
}
