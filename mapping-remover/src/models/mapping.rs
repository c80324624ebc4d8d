// Mapping lookup models
//
// None of these are persisted locally; they live for one lookup result set.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which side of the parent entity map matched the looked-up table/field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingDirection {
    SourceToTarget,
    TargetToSource,
}

impl MappingDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingDirection::SourceToTarget => "Source to Target",
            MappingDirection::TargetToSource => "Target to Source",
        }
    }
}

impl fmt::Display for MappingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One directional pairing between a source table+field and a target table+field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingResult {
    pub source_entity: String,
    pub source_attribute: String,
    pub target_entity: String,
    pub target_attribute: String,
    pub entity_map_id: Uuid,
    pub attribute_map_id: Uuid,
    pub direction: MappingDirection,
}

impl MappingResult {
    /// Case-insensitive composite identity used to collapse duplicates.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.source_entity,
            self.source_attribute,
            self.target_entity,
            self.target_attribute,
            self.entity_map_id,
            self.direction.as_str()
        )
        .to_lowercase()
    }

    /// `contact.emailaddress1 -> lead.emailaddress1`
    pub fn describe(&self) -> String {
        format!(
            "{}.{} -> {}.{}",
            self.source_entity, self.source_attribute, self.target_entity, self.target_attribute
        )
    }
}

/// Result of the guarded two-step delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub attribute_map_id: Uuid,
    pub entity_map_id: Uuid,
    /// True when the parent entity map had no children left and was removed too.
    pub entity_map_deleted: bool,
}

/// Table picker entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityItem {
    pub logical_name: String,
    pub display_name: String,
}

impl fmt::Display for EntityItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}

/// Field picker entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeItem {
    pub logical_name: String,
    pub display_name: String,
}

impl fmt::Display for AttributeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.logical_name)
    }
}
