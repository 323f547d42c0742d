//! The host-local name registry: a plain actor-served module mapping
//! actor names to listen endpoints, so unrelated process trees on the
//! same host can find each other without sharing a parent.
//!
//! Grounded the same way [`crate::registry`] grounds dispatch on
//! `srpc`'s service/method lookup: a `HashMap` behind a namespace, the
//! only difference being that this one is mutated by its own handlers
//! rather than populated once at startup. The "first actor to bind this
//! address becomes the arbiter, everyone else just connects" protocol
//! lives in [`crate::runtime::start_or_join`]; this module only holds the
//! registry table itself.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::proto::{StructValue, Value};
use crate::registry::Module;

pub const ARBITER_NS: &str = "arbiter";
pub const OP_REGISTER: &str = "register";
pub const OP_UNREGISTER: &str = "unregister";
pub const OP_FIND: &str = "find";

fn required_str(kwargs: &StructValue, key: &str) -> Result<String> {
    kwargs
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Protocol(format!("arbiter call missing required field `{key}`")))
}

/// Builds the `__system__`-independent module a standalone arbiter actor
/// registers under [`ARBITER_NS`]. Holds no reference to
/// [`crate::actor::Actor`] to avoid a circular dependency between the two
/// modules; [`crate::runtime`] wires the two together.
pub fn registry_module() -> Module {
    let records: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));

    let register_records = Arc::clone(&records);
    let unregister_records = Arc::clone(&records);
    let find_records = Arc::clone(&records);

    Module::new()
        .with_unary(OP_REGISTER, move |kwargs: StructValue| {
            let records = Arc::clone(&register_records);
            async move {
                let name = required_str(&kwargs, "name")?;
                let endpoint = required_str(&kwargs, "endpoint")?;
                records.lock().await.insert(name, endpoint);
                Ok(Value::null())
            }
        })
        .with_unary(OP_UNREGISTER, move |kwargs: StructValue| {
            let records = Arc::clone(&unregister_records);
            async move {
                let name = required_str(&kwargs, "name")?;
                records.lock().await.remove(&name);
                Ok(Value::null())
            }
        })
        .with_unary(OP_FIND, move |kwargs: StructValue| {
            let records = Arc::clone(&find_records);
            async move {
                let name = required_str(&kwargs, "name")?;
                let endpoint = records.lock().await.get(&name).cloned();
                Ok(endpoint.map(Value::from).unwrap_or_else(Value::null))
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::value::kwargs;

    #[tokio::test]
    async fn test_register_then_find() {
        let registry = Registry::new().register(ARBITER_NS, registry_module());

        registry
            .lookup(ARBITER_NS, OP_REGISTER)
            .unwrap()
            .call_unary(kwargs([("name", Value::from("worker")), ("endpoint", Value::from("127.0.0.1:9"))]))
            .await
            .unwrap();

        let found = registry
            .lookup(ARBITER_NS, OP_FIND)
            .unwrap()
            .call_unary(kwargs([("name", Value::from("worker"))]))
            .await
            .unwrap();
        assert_eq!(found.as_str(), Some("127.0.0.1:9"));

        let missing = registry
            .lookup(ARBITER_NS, OP_FIND)
            .unwrap()
            .call_unary(kwargs([("name", Value::from("ghost"))]))
            .await
            .unwrap();
        assert!(missing.is_null());
    }

    #[tokio::test]
    async fn test_unregister_removes_entry() {
        let registry = Registry::new().register(ARBITER_NS, registry_module());

        registry
            .lookup(ARBITER_NS, OP_REGISTER)
            .unwrap()
            .call_unary(kwargs([("name", Value::from("worker")), ("endpoint", Value::from("127.0.0.1:9"))]))
            .await
            .unwrap();
        registry
            .lookup(ARBITER_NS, OP_UNREGISTER)
            .unwrap()
            .call_unary(kwargs([("name", Value::from("worker"))]))
            .await
            .unwrap();
        let found = registry
            .lookup(ARBITER_NS, OP_FIND)
            .unwrap()
            .call_unary(kwargs([("name", Value::from("worker"))]))
            .await
            .unwrap();
        assert!(found.is_null());
    }
}
