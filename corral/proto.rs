//! Generated wire types.
//!
//! Compiled from `wire.proto` by `prost-build` (see `build.rs`). The
//! generated module is included verbatim; hand-written helpers for these
//! types live in [`crate::value`] and [`crate::envelope`].

include!(concat!(env!("OUT_DIR"), "/corral.wire.rs"));
