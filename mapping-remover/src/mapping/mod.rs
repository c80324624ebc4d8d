//! Mapping lookup and removal over `OrganizationService`.

pub mod catalog;
pub mod deletion;
pub mod inspector;

pub use catalog::MappingCatalog;
pub use deletion::delete_mapping;
pub use inspector::{dedupe_mappings, MappingInspectorService};

/// Alias of the parent entity map in linked queries.
pub const ENTITY_MAP_ALIAS: &str = "em";
