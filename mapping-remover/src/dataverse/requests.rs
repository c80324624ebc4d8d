// Organization requests routed through `OrganizationService::execute`.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityFilters {
    /// Table-level metadata only (labels).
    Entity,
    /// Table metadata plus its column definitions.
    Attributes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveEntityRequest {
    pub logical_name: String,
    pub entity_filters: EntityFilters,
    pub retrieve_as_if_published: bool,
}

impl RetrieveEntityRequest {
    pub fn new(logical_name: impl Into<String>, entity_filters: EntityFilters) -> Self {
        Self {
            logical_name: logical_name.into(),
            entity_filters,
            retrieve_as_if_published: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteMultipleSettings {
    pub continue_on_error: bool,
    pub return_responses: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrganizationRequest {
    RetrieveEntity(RetrieveEntityRequest),
    ExecuteMultiple {
        requests: Vec<OrganizationRequest>,
        settings: ExecuteMultipleSettings,
    },
}

impl OrganizationRequest {
    pub fn name(&self) -> &'static str {
        match self {
            OrganizationRequest::RetrieveEntity(_) => "RetrieveEntity",
            OrganizationRequest::ExecuteMultiple { .. } => "ExecuteMultiple",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteMultipleResponseItem {
    pub request_index: usize,
    pub response: Option<OrganizationResponse>,
    pub fault: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrganizationResponse {
    RetrieveEntity(EntityMetadata),
    ExecuteMultiple {
        responses: Vec<ExecuteMultipleResponseItem>,
        is_faulted: bool,
    },
}

// Metadata payloads, shaped like the Web API EntityDefinitions resource.

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocalizedLabel {
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Label {
    pub user_localized_label: Option<LocalizedLabel>,
}

impl Label {
    pub fn text(&self) -> Option<&str> {
        self.user_localized_label
            .as_ref()
            .map(|l| l.label.as_str())
            .filter(|l| !l.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeMetadata {
    pub logical_name: String,
    pub display_name: Option<Label>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntityMetadata {
    pub logical_name: String,
    pub display_name: Option<Label>,
    #[serde(default)]
    pub attributes: Vec<AttributeMetadata>,
}

impl EntityMetadata {
    pub fn label_or_logical(&self) -> String {
        self.display_name
            .as_ref()
            .and_then(Label::text)
            .unwrap_or(&self.logical_name)
            .to_string()
    }
}

impl AttributeMetadata {
    pub fn label_or_logical(&self) -> String {
        self.display_name
            .as_ref()
            .and_then(Label::text)
            .unwrap_or(&self.logical_name)
            .to_string()
    }
}
