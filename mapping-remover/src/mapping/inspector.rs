// Mapping inspector
//
// Finds every attribute map where a table/field pair appears on either side of its parent
// entity map. Two linked queries, one per direction, merged and deduplicated.

use super::ENTITY_MAP_ALIAS;
use crate::dataverse::{
    ColumnSet, ConditionOperator, Entity, JoinOperator, LinkEntity, OrganizationService,
    QueryExpression, ATTRIBUTE_MAP, ENTITY_MAP,
};
use crate::error::{ServiceError, ServiceResult};
use crate::models::mapping::{MappingDirection, MappingResult};
use crate::utils::cancel;
use crate::utils::validation::validate_logical_name;
use log::{debug, info};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct MappingInspectorService {
    service: Arc<dyn OrganizationService>,
}

impl MappingInspectorService {
    pub fn new(service: Arc<dyn OrganizationService>) -> Self {
        Self { service }
    }

    pub async fn find_attribute_mappings(
        &self,
        source_table: &str,
        source_field: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<MappingResult>> {
        let table = validate_logical_name(source_table, "Source entity")?;
        let field = validate_logical_name(source_field, "Source attribute")?;

        info!(
            "[PHASE: lookup] [STEP: find_mappings] Searching mappings for {}.{}",
            table, field
        );

        let mut results = self
            .query_direction(&table, &field, MappingDirection::SourceToTarget, cancel)
            .await?;
        let reverse = self
            .query_direction(&table, &field, MappingDirection::TargetToSource, cancel)
            .await?;
        results.extend(reverse);

        let merged = dedupe_mappings(results);
        cancel::check(cancel)?;

        info!(
            "[PHASE: lookup] [STEP: find_mappings] {} mapping(s) for {}.{}",
            merged.len(),
            table,
            field
        );
        Ok(merged)
    }

    async fn query_direction(
        &self,
        table: &str,
        field: &str,
        direction: MappingDirection,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<MappingResult>> {
        cancel::check(cancel)?;
        let query = direction_query(table, field, direction);
        let rows = self.service.retrieve_multiple(&query, cancel).await?;
        cancel::check(cancel)?;

        debug!(
            "[PHASE: lookup] [STEP: query_direction] {} returned {} row(s)",
            direction,
            rows.len()
        );

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows.entities {
            cancel::check(cancel)?;
            out.push(to_mapping(row, direction)?);
        }
        Ok(out)
    }
}

/// Linked attribute-map query for one direction.
///
/// SourceToTarget matches `sourceattributename` with the parent's `sourceentityname`;
/// TargetToSource matches the target columns.
pub fn direction_query(table: &str, field: &str, direction: MappingDirection) -> QueryExpression {
    let (field_column, table_column) = match direction {
        MappingDirection::SourceToTarget => ("sourceattributename", "sourceentityname"),
        MappingDirection::TargetToSource => ("targetattributename", "targetentityname"),
    };

    let mut query = QueryExpression::new(ATTRIBUTE_MAP).with_columns(ColumnSet::new([
        "attributemapid",
        "sourceattributename",
        "targetattributename",
        "entitymapid",
    ]));
    query
        .criteria
        .add_condition(field_column, ConditionOperator::Equal, field);

    let mut link = LinkEntity::new(
        ATTRIBUTE_MAP,
        ENTITY_MAP,
        "entitymapid",
        "entitymapid",
        JoinOperator::Inner,
    )
    .with_columns(ColumnSet::new(["sourceentityname", "targetentityname"]))
    .with_alias(ENTITY_MAP_ALIAS);
    link.link_criteria
        .add_condition(table_column, ConditionOperator::Equal, table);
    query.link_entities.push(link);
    query
}

/// A row without both ids cannot be deleted safely, so it fails the whole lookup.
fn to_mapping(row: &Entity, direction: MappingDirection) -> ServiceResult<MappingResult> {
    let entity_map_id = row
        .get_reference("entitymapid")
        .filter(|id| !id.is_nil())
        .ok_or_else(|| {
            ServiceError::remote(format!(
                "Attribute map {} has no parent entity map reference",
                row.id
            ))
        })?;
    if row.id.is_nil() {
        return Err(ServiceError::remote("Attribute map row has no id"));
    }

    let text = |v: Option<&str>| v.unwrap_or_default().to_string();
    Ok(MappingResult {
        source_entity: text(row.get_aliased_str(ENTITY_MAP_ALIAS, "sourceentityname")),
        source_attribute: text(row.get_str("sourceattributename")),
        target_entity: text(row.get_aliased_str(ENTITY_MAP_ALIAS, "targetentityname")),
        target_attribute: text(row.get_str("targetattributename")),
        entity_map_id,
        attribute_map_id: row.id,
        direction,
    })
}

/// Drop repeats of the composite key, keeping the first occurrence.
pub fn dedupe_mappings(mappings: Vec<MappingResult>) -> Vec<MappingResult> {
    let mut seen = HashSet::new();
    mappings
        .into_iter()
        .filter(|m| seen.insert(m.dedupe_key()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataverse::fake::FakeOrganizationService;
    use crate::error::ServiceError;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    fn mapping(src: &str, direction: MappingDirection, em: Uuid) -> MappingResult {
        MappingResult {
            source_entity: src.to_string(),
            source_attribute: "emailaddress1".into(),
            target_entity: "lead".into(),
            target_attribute: "emailaddress1".into(),
            entity_map_id: em,
            attribute_map_id: Uuid::new_v4(),
            direction,
        }
    }

    #[tokio::test]
    async fn returns_both_directions_without_collapsing() {
        let fake = Arc::new(FakeOrganizationService::new());
        let contact_to_lead = fake.add_entity_map("contact", "lead");
        let lead_to_contact = fake.add_entity_map("lead", "contact");
        let forward = fake.add_attribute_map(contact_to_lead, "emailaddress1", "emailaddress1");
        let backward = fake.add_attribute_map(lead_to_contact, "emailaddress1", "emailaddress1");
        let other = fake.add_entity_map("account", "contact");
        fake.add_attribute_map(other, "name", "fullname");

        let inspector = MappingInspectorService::new(fake.clone());
        let found = inspector
            .find_attribute_mappings("Contact", "EmailAddress1", &CancellationToken::new())
            .await
            .expect("mappings");

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].direction, MappingDirection::SourceToTarget);
        assert_eq!(found[0].attribute_map_id, forward);
        assert_eq!(found[0].entity_map_id, contact_to_lead);
        assert_eq!(found[0].describe(), "contact.emailaddress1 -> lead.emailaddress1");
        assert_eq!(found[1].direction, MappingDirection::TargetToSource);
        assert_eq!(found[1].attribute_map_id, backward);
        assert_eq!(found[1].describe(), "lead.emailaddress1 -> contact.emailaddress1");
        assert_eq!(fake.retrieve_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn field_matching_only_one_side_is_not_returned_for_other_side() {
        let fake = Arc::new(FakeOrganizationService::new());
        let em = fake.add_entity_map("contact", "lead");
        // Field sits on the target side, but the table is the source: no match.
        fake.add_attribute_map(em, "telephone1", "emailaddress1");

        let inspector = MappingInspectorService::new(fake);
        let found = inspector
            .find_attribute_mappings("contact", "emailaddress1", &CancellationToken::new())
            .await
            .expect("mappings");
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn self_mapping_appears_once_per_direction() {
        let fake = Arc::new(FakeOrganizationService::new());
        let em = fake.add_entity_map("contact", "contact");
        fake.add_attribute_map(em, "emailaddress1", "emailaddress1");

        let inspector = MappingInspectorService::new(fake);
        let found = inspector
            .find_attribute_mappings("contact", "emailaddress1", &CancellationToken::new())
            .await
            .expect("mappings");
        let directions: Vec<_> = found.iter().map(|m| m.direction).collect();
        assert_eq!(
            directions,
            vec![MappingDirection::SourceToTarget, MappingDirection::TargetToSource]
        );
    }

    #[tokio::test]
    async fn spaced_identifiers_are_rejected_before_any_remote_call() {
        let fake = Arc::new(FakeOrganizationService::new());
        let inspector = MappingInspectorService::new(fake.clone());
        let token = CancellationToken::new();

        for (table, field) in [(" contact", "emailaddress1"), ("contact", "email address"), ("", "x")] {
            let err = inspector
                .find_attribute_mappings(table, field, &token)
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::InvalidArgument(_)));
        }
        assert_eq!(fake.retrieve_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_mid_query_yields_cancelled_and_no_results() {
        let fake = Arc::new(FakeOrganizationService::new());
        let em = fake.add_entity_map("contact", "lead");
        fake.add_attribute_map(em, "emailaddress1", "emailaddress1");

        let token = CancellationToken::new();
        fake.cancel_on_retrieve(1, token.clone());

        let inspector = MappingInspectorService::new(fake.clone());
        let res = inspector
            .find_attribute_mappings("contact", "emailaddress1", &token)
            .await;
        assert!(matches!(res, Err(ServiceError::Cancelled)));
        assert_eq!(fake.retrieve_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_failures_propagate_unchanged() {
        struct Failing;
        #[async_trait::async_trait]
        impl OrganizationService for Failing {
            async fn retrieve_multiple(
                &self,
                _query: &QueryExpression,
                _cancel: &CancellationToken,
            ) -> ServiceResult<crate::dataverse::EntityCollection> {
                Err(ServiceError::remote_status(401, None, "Unauthorized"))
            }
            async fn execute(
                &self,
                _request: crate::dataverse::OrganizationRequest,
                _cancel: &CancellationToken,
            ) -> ServiceResult<crate::dataverse::OrganizationResponse> {
                unreachable!()
            }
            async fn delete(&self, _: &str, _: Uuid, _: &CancellationToken) -> ServiceResult<()> {
                unreachable!()
            }
        }

        let inspector = MappingInspectorService::new(Arc::new(Failing));
        let err = inspector
            .find_attribute_mappings("contact", "emailaddress1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::RemoteFailure { status: Some(401), .. }
        ));
    }

    #[tokio::test]
    async fn row_without_parent_reference_fails_the_lookup() {
        struct Orphans;
        #[async_trait::async_trait]
        impl OrganizationService for Orphans {
            async fn retrieve_multiple(
                &self,
                query: &QueryExpression,
                _cancel: &CancellationToken,
            ) -> ServiceResult<crate::dataverse::EntityCollection> {
                let row = Entity::from_json(
                    &query.entity_name,
                    serde_json::json!({
                        "attributemapid": Uuid::new_v4().to_string(),
                        "sourceattributename": "emailaddress1",
                        "targetattributename": "emailaddress1",
                        "em.sourceentityname": "contact",
                        "em.targetentityname": "lead",
                    }),
                );
                Ok(crate::dataverse::EntityCollection {
                    entity_name: query.entity_name.clone(),
                    entities: vec![row],
                    more_records: false,
                })
            }
            async fn execute(
                &self,
                _request: crate::dataverse::OrganizationRequest,
                _cancel: &CancellationToken,
            ) -> ServiceResult<crate::dataverse::OrganizationResponse> {
                unreachable!()
            }
            async fn delete(&self, _: &str, _: Uuid, _: &CancellationToken) -> ServiceResult<()> {
                unreachable!()
            }
        }

        let inspector = MappingInspectorService::new(Arc::new(Orphans));
        let err = inspector
            .find_attribute_mappings("contact", "emailaddress1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            ServiceError::RemoteFailure { message, .. } if message.contains("no parent entity map")
        ));
    }

    #[test]
    fn dedupe_is_case_insensitive_and_keeps_first_seen_order() {
        let em = Uuid::new_v4();
        let a = mapping("contact", MappingDirection::SourceToTarget, em);
        let mut a_upper = a.clone();
        a_upper.source_entity = "CONTACT".into();
        a_upper.attribute_map_id = Uuid::new_v4();
        let b = mapping("contact", MappingDirection::TargetToSource, em);

        let out = dedupe_mappings(vec![a.clone(), a_upper, b.clone()]);
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn dedupe_is_idempotent() {
        let em = Uuid::new_v4();
        let input = vec![
            mapping("contact", MappingDirection::SourceToTarget, em),
            mapping("contact", MappingDirection::SourceToTarget, em),
            mapping("account", MappingDirection::SourceToTarget, em),
            mapping("contact", MappingDirection::TargetToSource, Uuid::new_v4()),
        ];
        let once = dedupe_mappings(input);
        let twice = dedupe_mappings(once.clone());
        assert_eq!(once.len(), 3);
        assert_eq!(once, twice);
    }

    #[test]
    fn direction_query_filters_the_matching_side() {
        let q = direction_query("contact", "emailaddress1", MappingDirection::TargetToSource);
        assert_eq!(q.criteria.conditions[0].attribute, "targetattributename");
        assert_eq!(q.link_entities[0].alias.as_deref(), Some("em"));
        assert_eq!(
            q.link_entities[0].link_criteria.conditions[0].attribute,
            "targetentityname"
        );
        assert_eq!(q.link_entities[0].join, JoinOperator::Inner);
    }
}
