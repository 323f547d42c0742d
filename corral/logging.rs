//! Structured, per-actor-tagged logging.
//!
//! Grounded on the teacher's preference for leveled, structured
//! diagnostics over bare `println!` (the teacher logs protocol violations
//! and dropped reads rather than silently swallowing them); this module
//! adds the `tracing`/`tracing-subscriber` setup the teacher's own crate
//! leaves to its embedder.

use tracing_subscriber::EnvFilter;

use crate::context::Uid;

/// Initialises the global `tracing` subscriber. `default_directive` seeds
/// the `EnvFilter` default (overridden by `RUST_LOG` if set), matching the
/// child entry point's `--loglevel` argument.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// A span tagging every log record emitted while it is entered with the
/// owning actor's `uid`, so multi-process output can be demultiplexed by
/// actor when aggregated.
pub fn actor_span(uid: &Uid) -> tracing::Span {
    tracing::info_span!("actor", uid = %uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_span_carries_uid() {
        let uid = Uid::new("worker", "i0");
        let span = actor_span(&uid);
        // A constructed span with a metadata name is the observable
        // contract here; field values are only visible to a subscriber.
        assert_eq!(span.metadata().map(|m| m.name()), Some("actor"));
    }
}
