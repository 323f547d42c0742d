//! Argv contract for a spawned child actor process.
//!
//! `<runtime-entry> --uid <name> <instance_id> --parent <host>:<port>
//! --arbiter <host>:<port> [--loglevel L]`, parsed with `clap`'s derive
//! API rather than hand-rolled argument scanning, matching how the rest of
//! this stack prefers a crate over stdlib-only plumbing for ambient
//! concerns.

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "corral-actor", about = "Child actor process entry point")]
pub struct ChildArgs {
    /// Logical actor name and fresh instance id, e.g. `--uid worker abc123`.
    #[arg(long, num_args = 2, value_names = ["NAME", "INSTANCE_ID"])]
    pub uid: Vec<String>,

    /// `host:port` of the parent actor's listener.
    #[arg(long)]
    pub parent: String,

    /// `host:port` of the arbiter.
    #[arg(long)]
    pub arbiter: String,

    /// Default `tracing` directive, e.g. `info` or `corral=debug`.
    #[arg(long, default_value = "info")]
    pub loglevel: String,

    /// Name of a task registered with [`crate::tasks::register_task`] to
    /// run as this actor's main task. Absent for a plain worker actor that
    /// only serves RPC modules registered by its own binary.
    #[arg(long)]
    pub task: Option<String>,
}

impl ChildArgs {
    pub fn name(&self) -> &str {
        &self.uid[0]
    }

    pub fn instance_id(&self) -> &str {
        &self.uid[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_full_argv() {
        let args = ChildArgs::try_parse_from([
            "corral-actor",
            "--uid",
            "worker",
            "abc123",
            "--parent",
            "127.0.0.1:9000",
            "--arbiter",
            "127.0.0.1:4900",
            "--loglevel",
            "debug",
        ])
        .unwrap();

        assert_eq!(args.name(), "worker");
        assert_eq!(args.instance_id(), "abc123");
        assert_eq!(args.parent, "127.0.0.1:9000");
        assert_eq!(args.arbiter, "127.0.0.1:4900");
        assert_eq!(args.loglevel, "debug");
    }

    #[test]
    fn test_loglevel_defaults_to_info() {
        let args = ChildArgs::try_parse_from([
            "corral-actor",
            "--uid",
            "worker",
            "abc123",
            "--parent",
            "127.0.0.1:9000",
            "--arbiter",
            "127.0.0.1:4900",
        ])
        .unwrap();
        assert_eq!(args.loglevel, "info");
    }

    #[test]
    fn test_missing_required_arg_fails() {
        let result = ChildArgs::try_parse_from(["corral-actor", "--uid", "worker", "abc123"]);
        assert!(result.is_err());
    }
}
