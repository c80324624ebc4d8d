// Retrieved records
//
// Rows keep the Web API JSON shape: plain columns by logical name, link-entity columns as
// `alias.column`, lookups as `_column_value`.

use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Entity {
    pub logical_name: String,
    pub id: Uuid,
    pub attributes: Map<String, Value>,
}

impl Entity {
    /// Build a row from a Web API record. The primary key column is `<logical_name>id`.
    pub fn from_json(logical_name: &str, value: Value) -> Self {
        let attributes = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let id_key = format!("{}id", logical_name);
        let id = attributes
            .get(&id_key)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_default();
        Self {
            logical_name: logical_name.to_string(),
            id,
            attributes,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    /// Link-entity column, e.g. `em.sourceentityname`.
    pub fn get_aliased_str(&self, alias: &str, name: &str) -> Option<&str> {
        self.get_str(&format!("{}.{}", alias, name))
    }

    /// Lookup column id. Accepts both `_name_value` (Web API) and a bare `name`.
    pub fn get_reference(&self, name: &str) -> Option<Uuid> {
        let key = format!("_{}_value", name);
        self.get_str(&key)
            .or_else(|| self.get_str(name))
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityCollection {
    pub entity_name: String,
    pub entities: Vec<Entity>,
    pub more_records: bool,
}

impl EntityCollection {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_reads_primary_key_and_aliases() {
        let id = Uuid::new_v4();
        let parent = Uuid::new_v4();
        let row = Entity::from_json(
            "attributemap",
            json!({
                "attributemapid": id.to_string(),
                "sourceattributename": "emailaddress1",
                "_entitymapid_value": parent.to_string(),
                "em.sourceentityname": "contact",
            }),
        );
        assert_eq!(row.id, id);
        assert_eq!(row.get_str("sourceattributename"), Some("emailaddress1"));
        assert_eq!(row.get_aliased_str("em", "sourceentityname"), Some("contact"));
        assert_eq!(row.get_reference("entitymapid"), Some(parent));
    }

    #[test]
    fn missing_or_malformed_id_is_nil() {
        let row = Entity::from_json("entitymap", json!({ "entitymapid": "not-a-guid" }));
        assert!(row.id.is_nil());
        assert_eq!(row.get_reference("parent"), None);
    }
}
