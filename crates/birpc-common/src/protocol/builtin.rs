//! Reserved `system.*` methods.
//!
//! `system.listComponents` is answered through the ordinary method registry
//! on the receiving side; only the calling side treats it specially (it runs
//! it on connect and on re-sync). `system.announce` is a notification a peer
//! sends after registering new components.

use serde_json::{Map, Value};
use std::collections::BTreeSet;

use super::params::MethodName;

/// Discovery request: no params, result is an object keyed by method name.
pub const LIST_COMPONENTS: &str = "system.listComponents";

/// Notification telling the peer our component set grew.
pub const ANNOUNCE: &str = "system.announce";

/// Namespace reserved for protocol methods. Never advertised.
pub const SYSTEM_NAMESPACE: &str = "system";

/// Whether `method` lives in the reserved `system` namespace.
pub fn is_system_method(method: &str) -> bool {
    method
        .split_once('.')
        .map(|(ns, _)| ns == SYSTEM_NAMESPACE)
        .unwrap_or(false)
}

/// Builds the `system.listComponents` result: `{"Calc.add": true, ...}`.
pub fn component_list<'a, I>(names: I) -> Value
where
    I: IntoIterator<Item = &'a MethodName>,
{
    let map: Map<String, Value> = names
        .into_iter()
        .map(|name| (name.clone(), Value::Bool(true)))
        .collect();
    Value::Object(map)
}

/// Reads the method names out of a `system.listComponents` result.
///
/// Only the keys matter; anything that is not an object yields no names.
pub fn parse_component_list(value: &Value) -> BTreeSet<MethodName> {
    value
        .as_object()
        .map(|map| {
            map.keys()
                .filter(|name| !is_system_method(name))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_component_list_shape() {
        let names = vec!["Calc.add".to_string(), "Calc.sub".to_string()];
        assert_eq!(
            component_list(&names),
            json!({"Calc.add": true, "Calc.sub": true})
        );
    }

    #[test]
    fn test_parse_component_list_ignores_values() {
        let parsed = parse_component_list(&json!({"Calc.add": true, "Echo.echo": null}));
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains("Echo.echo"));
    }

    #[test]
    fn test_parse_component_list_drops_system_names() {
        let parsed = parse_component_list(&json!({"system.listComponents": true, "A.b": true}));
        assert_eq!(parsed.into_iter().collect::<Vec<_>>(), vec!["A.b".to_string()]);
    }

    #[test]
    fn test_parse_component_list_non_object() {
        assert!(parse_component_list(&json!([1, 2])).is_empty());
    }

    #[test]
    fn test_is_system_method() {
        assert!(is_system_method(LIST_COMPONENTS));
        assert!(is_system_method(ANNOUNCE));
        assert!(!is_system_method("systemd.start"));
        assert!(!is_system_method("Calc.add"));
    }
}
