//! Default access policy created alongside new entities

use serde_json::{json, Value};

/// Owner subject used when none is configured
pub const DEFAULT_POLICY_SUBJECT: &str = "ditto";

/// Resources the owner entry covers
const RESOURCES: [&str; 3] = ["thing:/", "policy:/", "message:/"];

/// Build the default policy document.
///
/// A single `owner` entry grants `READ` and `WRITE` on every resource kind
/// to `subject`, authenticated with basic auth.
pub fn default_policy(subject: &str) -> Value {
    let resources: serde_json::Map<String, Value> = RESOURCES
        .iter()
        .map(|r| {
            (
                r.to_string(),
                json!({"grant": ["READ", "WRITE"], "revoke": []}),
            )
        })
        .collect();

    json!({
        "entries": {
            "owner": {
                "subjects": {
                    subject: {"type": "basic-auth"}
                },
                "resources": resources
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_policy_grants_read_write() {
        let policy = default_policy(DEFAULT_POLICY_SUBJECT);
        let owner = &policy["entries"]["owner"];

        assert_eq!(owner["subjects"]["ditto"]["type"], "basic-auth");
        for resource in RESOURCES {
            assert_eq!(owner["resources"][resource]["grant"], json!(["READ", "WRITE"]));
            assert_eq!(owner["resources"][resource]["revoke"], json!([]));
        }
    }

    #[test]
    fn subject_is_configurable() {
        let policy = default_policy("nginx:admin");
        assert!(policy["entries"]["owner"]["subjects"]["nginx:admin"].is_object());
        assert!(policy["entries"]["owner"]["subjects"]["ditto"].is_null());
    }
}
