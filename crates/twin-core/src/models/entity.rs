//! Entity (thing) models

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A digital twin as stored by the backend.
///
/// The gateway never keeps a copy; this type only exists to give the typed
/// CRUD endpoints a shape to decode into and re-encode from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Backend-wide unique identifier (`namespace:name`)
    #[serde(default)]
    pub thing_id: String,
    /// Policy governing access to this entity
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_id: String,
    /// Optional thing definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    /// Free-form attributes
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    /// Named features
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub features: HashMap<String, Feature>,
}

impl Entity {
    /// Create an empty entity with the given id
    pub fn new(thing_id: impl Into<String>) -> Self {
        Self {
            thing_id: thing_id.into(),
            ..Default::default()
        }
    }

    /// Set the policy id
    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = policy_id.into();
        self
    }

    /// Add a feature
    pub fn with_feature(mut self, name: impl Into<String>, feature: Feature) -> Self {
        self.features.insert(name.into(), feature);
        self
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get a string attribute
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Namespace part of the thing id (`"org.acme"` for `"org.acme:sensor-1"`)
    pub fn namespace(&self) -> Option<&str> {
        self.thing_id.split_once(':').map(|(ns, _)| ns)
    }
}

/// A named sub-resource of an entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub definition: Vec<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_properties: Option<Map<String, Value>>,
}

impl Feature {
    /// Create a feature with a single property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Current state of a device: id plus features only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub thing_id: String,
    #[serde(default)]
    pub features: HashMap<String, Feature>,
}

impl From<Entity> for DeviceState {
    fn from(entity: Entity) -> Self {
        Self {
            thing_id: entity.thing_id,
            features: entity.features,
        }
    }
}

/// Response for the device listing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceList {
    pub items: Vec<Entity>,
    pub total: usize,
}

impl DeviceList {
    pub fn new(items: Vec<Entity>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

/// Command sent to a device feature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub command: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Filters accepted by the device listing endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceFilter {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl DeviceFilter {
    /// Render the filter as a backend RQL expression.
    ///
    /// Without any criteria this is `exists(thingId)`, matching every thing.
    pub fn to_rql(&self) -> String {
        let mut clauses = Vec::new();
        if let Some(ns) = non_empty(&self.namespace) {
            clauses.push(format!("like(thingId,\"{}:*\")", escape_rql(ns)));
        }
        if let Some(company) = non_empty(&self.company) {
            clauses.push(format!("eq(attributes/company,\"{}\")", escape_rql(company)));
        }
        if let Some(location) = non_empty(&self.location) {
            clauses.push(format!(
                "eq(attributes/location,\"{}\")",
                escape_rql(location)
            ));
        }

        match clauses.len() {
            0 => "exists(thingId)".to_string(),
            1 => clauses.remove(0),
            _ => format!("and({})", clauses.join(",")),
        }
    }

    /// Check an entity against the filter locally.
    ///
    /// The backend already filters, but results are re-checked so the
    /// gateway never returns an entity outside the requested criteria.
    pub fn matches(&self, entity: &Entity) -> bool {
        if let Some(ns) = non_empty(&self.namespace) {
            if entity.namespace() != Some(ns) {
                return false;
            }
        }
        if let Some(company) = non_empty(&self.company) {
            if entity.attribute_str("company") != Some(company) {
                return false;
            }
        }
        if let Some(location) = non_empty(&self.location) {
            if entity.attribute_str("location") != Some(location) {
                return false;
            }
        }
        true
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn escape_rql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn entity_roundtrips_backend_shape() {
        let raw = json!({
            "thingId": "org.acme:sensor-1",
            "policyId": "org.acme:policy",
            "attributes": {"company": "acme"},
            "features": {
                "temp": {
                    "properties": {"value": 21.5},
                    "desiredProperties": {"value": 20}
                }
            }
        });

        let entity: Entity = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(entity.thing_id, "org.acme:sensor-1");
        assert_eq!(entity.namespace(), Some("org.acme"));
        assert_eq!(entity.attribute_str("company"), Some("acme"));
        assert!(entity.features["temp"].desired_properties.is_some());

        assert_eq!(serde_json::to_value(&entity).unwrap(), raw);
    }

    #[test]
    fn empty_sections_are_omitted() {
        let entity = Entity::new("ns:x");
        assert_eq!(serde_json::to_value(&entity).unwrap(), json!({"thingId": "ns:x"}));
    }

    #[test]
    fn filter_without_criteria_matches_everything() {
        let filter = DeviceFilter::default();
        assert_eq!(filter.to_rql(), "exists(thingId)");
        assert!(filter.matches(&Entity::new("a:b")));
    }

    #[test]
    fn filter_combines_criteria() {
        let filter = DeviceFilter {
            namespace: Some("org.acme".into()),
            company: Some("acme".into()),
            location: None,
        };
        assert_eq!(
            filter.to_rql(),
            r#"and(like(thingId,"org.acme:*"),eq(attributes/company,"acme"))"#
        );

        let hit = Entity::new("org.acme:s1").with_attribute("company", "acme");
        let wrong_company = Entity::new("org.acme:s2").with_attribute("company", "other");
        let wrong_ns = Entity::new("org.other:s3").with_attribute("company", "acme");
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&wrong_company));
        assert!(!filter.matches(&wrong_ns));
    }

    #[test]
    fn filter_escapes_quotes() {
        let filter = DeviceFilter {
            location: Some("hall \"B\"".into()),
            ..Default::default()
        };
        assert_eq!(filter.to_rql(), r#"eq(attributes/location,"hall \"B\"")"#);
    }
}
