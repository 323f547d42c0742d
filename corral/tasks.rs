//! Process-global table of named entry-point functions a child process can
//! be told to run.
//!
//! A spawned child is a re-exec of the same binary; there is no way to
//! ship an arbitrary Rust closure across the process boundary the way the
//! source language's `run_in_actor` ships a callable. Instead the
//! application registers its task functions once, by name, with
//! [`register_task`]; the child process is told which one to run via the
//! `--task` argv flag (see [`crate::cli::ChildArgs`]) and looks it up here.
//! Grounded on the same "name maps to a dispatcher" idiom as
//! [`crate::registry::Registry`], applied to process entry points instead
//! of RPC methods.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;

use crate::error::Result;
use crate::proto::{StructValue, Value};

pub type TaskFn =
    Arc<dyn Fn(StructValue) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

static TASKS: OnceLock<Mutex<HashMap<String, TaskFn>>> = OnceLock::new();

fn table() -> &'static Mutex<HashMap<String, TaskFn>> {
    TASKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers a named task function, callable by a child process spawned
/// with `--task <name>`.
pub fn register_task<F, Fut>(name: impl Into<String>, f: F)
where
    F: Fn(StructValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    table().lock().unwrap().insert(name.into(), Arc::new(move |kwargs| Box::pin(f(kwargs))));
}

/// Looks up a previously registered task function.
pub fn lookup_task(name: &str) -> Option<TaskFn> {
    table().lock().unwrap().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_lookup() {
        register_task("greet", |kw: StructValue| async move {
            let name = kw.get("name").and_then(|v| v.as_str()).unwrap_or("world").to_string();
            Ok(Value::from(format!("hello, {name}")))
        });

        let task = lookup_task("greet").expect("registered");
        let result = task(StructValue::new().with("name", "corral")).await.unwrap();
        assert_eq!(result.as_str(), Some("hello, corral"));
    }

    #[test]
    fn test_missing_task() {
        assert!(lookup_task("does-not-exist-xyz").is_none());
    }
}
