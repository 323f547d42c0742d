//! Process-wide runtime configuration and the current-actor handle.
//!
//! Grounded on the teacher's env-driven `ServerConfig` (see `server.rs`)
//! generalised to the two environment knobs this runtime reads once at
//! root-actor construction time, plus the "current actor" singleton the
//! specification calls for: an initialise-once process handle reached via a
//! free function rather than scattered global mutable state.

use std::env;
use std::sync::{Arc, OnceLock};

use crate::actor::Actor;
use crate::error::{Error, Result};

/// Runtime configuration read from the environment once, at root-actor
/// construction time.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `DEBUG_MODE`: enables post-mortem handling for non-cancellation
    /// errors, serialised through the debug mutex.
    pub debug_mode: bool,
    /// `ARBITER_ADDR`: overrides the default arbiter endpoint.
    pub arbiter_addr: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            debug_mode: env::var("DEBUG_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            arbiter_addr: env::var("ARBITER_ADDR").ok(),
        }
    }

    pub const DEFAULT_ARBITER_ADDR: &'static str = "127.0.0.1:4900";

    pub fn arbiter_addr(&self) -> &str {
        self.arbiter_addr.as_deref().unwrap_or(Self::DEFAULT_ARBITER_ADDR)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { debug_mode: false, arbiter_addr: None }
    }
}

static CURRENT_ACTOR: OnceLock<Arc<Actor>> = OnceLock::new();

/// Installs the process-wide actor handle. Called exactly once, by
/// [`crate::runtime::run`]. Calling it twice is a programmer error.
pub fn init_current_actor(actor: Arc<Actor>) {
    if CURRENT_ACTOR.set(actor).is_err() {
        panic!("current actor already initialised");
    }
}

/// Returns the process-wide actor handle.
///
/// Errors rather than panics if called before [`init_current_actor`], since
/// a library consumer probing for the current actor from an unexpected
/// context should get a recoverable error, not take the whole process down.
pub fn current_actor() -> Result<&'static Arc<Actor>> {
    CURRENT_ACTOR.get().ok_or_else(|| {
        Error::Protocol("current actor accessed before runtime initialisation".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_arbiter_addr() {
        let cfg = RuntimeConfig { debug_mode: false, arbiter_addr: None };
        assert_eq!(cfg.arbiter_addr(), RuntimeConfig::DEFAULT_ARBITER_ADDR);
    }

    #[test]
    fn test_explicit_arbiter_addr_overrides_default() {
        let cfg = RuntimeConfig {
            debug_mode: false,
            arbiter_addr: Some("10.0.0.1:9000".to_string()),
        };
        assert_eq!(cfg.arbiter_addr(), "10.0.0.1:9000");
    }
}
