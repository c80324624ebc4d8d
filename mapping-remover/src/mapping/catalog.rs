// Tables and fields that take part in any mapping; feeds the lookup suggestions.

use super::ENTITY_MAP_ALIAS;
use crate::dataverse::{
    ColumnSet, ConditionOperator, EntityCollection, JoinOperator, LinkEntity,
    OrganizationService, QueryExpression, ATTRIBUTE_MAP, ENTITY_MAP,
};
use crate::error::ServiceResult;
use crate::utils::cancel;
use crate::utils::validation::validate_logical_name;
use log::debug;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct MappingCatalog {
    service: Arc<dyn OrganizationService>,
}

impl MappingCatalog {
    pub fn new(service: Arc<dyn OrganizationService>) -> Self {
        Self { service }
    }

    /// Every table named on either side of an entity map, sorted case-insensitively.
    pub async fn list_mapped_entities(&self, cancel: &CancellationToken) -> ServiceResult<Vec<String>> {
        cancel::check(cancel)?;
        let query = QueryExpression::new(ENTITY_MAP)
            .with_columns(ColumnSet::new(["sourceentityname", "targetentityname"]));
        let rows = self.service.retrieve_multiple(&query, cancel).await?;
        cancel::check(cancel)?;

        let names = collect_names(&rows, &["sourceentityname", "targetentityname"], cancel)?;
        debug!(
            "[PHASE: catalog] [STEP: entities] {} entity map(s), {} distinct table(s)",
            rows.len(),
            names.len()
        );
        Ok(names)
    }

    /// Fields of `table` that appear on the matching side of any of its mappings.
    pub async fn list_mapped_attributes(
        &self,
        table: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<String>> {
        let table = validate_logical_name(table, "Entity")?;

        cancel::check(cancel)?;
        let sources = self
            .service
            .retrieve_multiple(
                &side_query(&table, "sourceattributename", "sourceentityname"),
                cancel,
            )
            .await?;
        cancel::check(cancel)?;
        let targets = self
            .service
            .retrieve_multiple(
                &side_query(&table, "targetattributename", "targetentityname"),
                cancel,
            )
            .await?;
        cancel::check(cancel)?;

        let mut names = collect_names(&sources, &["sourceattributename"], cancel)?;
        names.extend(collect_names(&targets, &["targetattributename"], cancel)?);
        let names = sort_unique(names);
        debug!(
            "[PHASE: catalog] [STEP: attributes] {} mapped field(s) on {}",
            names.len(),
            table
        );
        Ok(names)
    }
}

fn side_query(table: &str, field_column: &str, table_column: &str) -> QueryExpression {
    let mut query = QueryExpression::new(ATTRIBUTE_MAP)
        .with_columns(ColumnSet::new([field_column]))
        .distinct();
    let mut link = LinkEntity::new(
        ATTRIBUTE_MAP,
        ENTITY_MAP,
        "entitymapid",
        "entitymapid",
        JoinOperator::Inner,
    )
    .with_alias(ENTITY_MAP_ALIAS);
    link.link_criteria
        .add_condition(table_column, ConditionOperator::Equal, table);
    query.link_entities.push(link);
    query
}

fn collect_names(
    rows: &EntityCollection,
    columns: &[&str],
    cancel: &CancellationToken,
) -> ServiceResult<Vec<String>> {
    let mut names = Vec::new();
    for row in &rows.entities {
        cancel::check(cancel)?;
        for column in columns {
            if let Some(v) = row.get_str(column) {
                names.push(v.to_string());
            }
        }
    }
    Ok(sort_unique(names))
}

/// Trim, drop blanks, dedupe case-insensitively (first spelling wins) and sort.
pub fn sort_unique(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out: Vec<String> = names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && seen.insert(n.to_lowercase()))
        .collect();
    out.sort_by_key(|n| n.to_lowercase());
    out
}
