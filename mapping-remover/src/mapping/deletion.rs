// Guarded two-step delete
//
// 1. delete the attribute map
// 2. look for any sibling still pointing at the same entity map (page size 1)
// 3. delete the entity map when none remain
//
// There is no compensation: if step 2 or 3 fails after step 1, the entity map survives with
// zero children.

use crate::dataverse::{
    ColumnSet, ConditionOperator, OrganizationService, QueryExpression, ATTRIBUTE_MAP,
    ENTITY_MAP,
};
use crate::error::ServiceResult;
use crate::models::mapping::{DeleteOutcome, MappingResult};
use crate::utils::cancel;
use log::{info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub async fn delete_mapping(
    service: &dyn OrganizationService,
    mapping: &MappingResult,
    cancel: &CancellationToken,
) -> ServiceResult<DeleteOutcome> {
    cancel::check(cancel)?;

    // Past this point the server may already have removed the child, so the remaining steps
    // run to completion even if the caller cancels.
    let finish = CancellationToken::new();

    info!(
        "[PHASE: delete] [STEP: attribute_map] Deleting attribute map {} ({})",
        mapping.attribute_map_id,
        mapping.describe()
    );
    service
        .delete(ATTRIBUTE_MAP, mapping.attribute_map_id, &finish)
        .await?;

    let remaining = service
        .retrieve_multiple(&remaining_children_query(mapping.entity_map_id), &finish)
        .await
        .map_err(|e| {
            warn!(
                "[PHASE: delete] [STEP: orphan_check] Attribute map {} deleted but orphan check failed: {}",
                mapping.attribute_map_id, e
            );
            e
        })?;

    let mut entity_map_deleted = false;
    if remaining.is_empty() {
        info!(
            "[PHASE: delete] [STEP: entity_map] Entity map {} has no children left; deleting",
            mapping.entity_map_id
        );
        service
            .delete(ENTITY_MAP, mapping.entity_map_id, &finish)
            .await
            .map_err(|e| {
                warn!(
                    "[PHASE: delete] [STEP: entity_map] Entity map {} left orphaned: {}",
                    mapping.entity_map_id, e
                );
                e
            })?;
        entity_map_deleted = true;
    }

    Ok(DeleteOutcome {
        attribute_map_id: mapping.attribute_map_id,
        entity_map_id: mapping.entity_map_id,
        entity_map_deleted,
    })
}

/// Existence check for attribute maps still owned by `entity_map_id`.
pub fn remaining_children_query(entity_map_id: Uuid) -> QueryExpression {
    let mut query = QueryExpression::new(ATTRIBUTE_MAP)
        .with_columns(ColumnSet::new(["attributemapid"]))
        .with_page(1, 1);
    query
        .criteria
        .add_condition("entitymapid", ConditionOperator::Equal, entity_map_id);
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataverse::fake::FakeOrganizationService;
    use crate::error::ServiceError;
    use crate::models::mapping::MappingDirection;
    use async_trait::async_trait;
    use crate::dataverse::{EntityCollection, OrganizationRequest, OrganizationResponse};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    /// Applies deletes immediately, then holds the response back until `latency` passes.
    struct SlowDeleteResponse {
        inner: FakeOrganizationService,
        latency: Duration,
    }

    #[async_trait]
    impl OrganizationService for SlowDeleteResponse {
        async fn retrieve_multiple(
            &self,
            query: &QueryExpression,
            cancel: &CancellationToken,
        ) -> ServiceResult<EntityCollection> {
            self.inner.retrieve_multiple(query, cancel).await
        }

        async fn execute(
            &self,
            request: OrganizationRequest,
            cancel: &CancellationToken,
        ) -> ServiceResult<OrganizationResponse> {
            self.inner.execute(request, cancel).await
        }

        async fn delete(
            &self,
            entity_name: &str,
            id: Uuid,
            cancel: &CancellationToken,
        ) -> ServiceResult<()> {
            self.inner.delete(entity_name, id, cancel).await?;
            let latency = self.latency;
            cancel::run(cancel, async move {
                tokio::time::sleep(latency).await;
                Ok(())
            })
            .await
        }
    }

    fn result_for(entity_map_id: Uuid, attribute_map_id: Uuid) -> MappingResult {
        MappingResult {
            source_entity: "contact".into(),
            source_attribute: "emailaddress1".into(),
            target_entity: "lead".into(),
            target_attribute: "emailaddress1".into(),
            entity_map_id,
            attribute_map_id,
            direction: MappingDirection::SourceToTarget,
        }
    }

    #[tokio::test]
    async fn deleting_only_child_removes_parent() {
        let fake = FakeOrganizationService::new();
        let em = fake.add_entity_map("contact", "lead");
        let am = fake.add_attribute_map(em, "emailaddress1", "emailaddress1");

        let outcome = delete_mapping(&fake, &result_for(em, am), &CancellationToken::new())
            .await
            .expect("delete");

        assert!(outcome.entity_map_deleted);
        assert!(!fake.has_attribute_map(am));
        assert!(!fake.has_entity_map(em));
        assert_eq!(
            fake.deleted(),
            vec![(ATTRIBUTE_MAP.to_string(), am), (ENTITY_MAP.to_string(), em)]
        );
    }

    #[tokio::test]
    async fn deleting_one_of_several_children_keeps_parent() {
        let fake = FakeOrganizationService::new();
        let em = fake.add_entity_map("contact", "lead");
        let am = fake.add_attribute_map(em, "emailaddress1", "emailaddress1");
        let sibling = fake.add_attribute_map(em, "firstname", "firstname");

        let outcome = delete_mapping(&fake, &result_for(em, am), &CancellationToken::new())
            .await
            .expect("delete");

        assert!(!outcome.entity_map_deleted);
        assert!(fake.has_entity_map(em));
        assert!(fake.has_attribute_map(sibling));
        assert_eq!(fake.delete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_child_delete_skips_orphan_check() {
        let fake = FakeOrganizationService::new();
        let em = fake.add_entity_map("contact", "lead");
        let am = fake.add_attribute_map(em, "emailaddress1", "emailaddress1");
        fake.fail_deletes_of(ATTRIBUTE_MAP);

        let err = delete_mapping(&fake, &result_for(em, am), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::RemoteFailure { status: Some(403), .. }));
        assert_eq!(fake.retrieve_calls.load(Ordering::SeqCst), 0);
        assert!(fake.has_entity_map(em));
    }

    #[tokio::test]
    async fn failed_parent_delete_leaves_orphan_behind() {
        let fake = FakeOrganizationService::new();
        let em = fake.add_entity_map("contact", "lead");
        let am = fake.add_attribute_map(em, "emailaddress1", "emailaddress1");
        fake.fail_deletes_of(ENTITY_MAP);

        let res = delete_mapping(&fake, &result_for(em, am), &CancellationToken::new()).await;

        assert!(res.is_err());
        assert!(!fake.has_attribute_map(am));
        assert!(fake.has_entity_map(em));
    }

    #[tokio::test]
    async fn cancelled_before_start_deletes_nothing() {
        let fake = FakeOrganizationService::new();
        let em = fake.add_entity_map("contact", "lead");
        let am = fake.add_attribute_map(em, "emailaddress1", "emailaddress1");
        let token = CancellationToken::new();
        token.cancel();

        let res = delete_mapping(&fake, &result_for(em, am), &token).await;
        assert!(matches!(res, Err(ServiceError::Cancelled)));
        assert_eq!(fake.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_during_child_delete_still_removes_orphaned_parent() {
        let fake = FakeOrganizationService::new();
        let em = fake.add_entity_map("contact", "lead");
        let am = fake.add_attribute_map(em, "emailaddress1", "emailaddress1");
        let service = SlowDeleteResponse {
            inner: fake,
            latency: Duration::from_millis(50),
        };
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let outcome = delete_mapping(&service, &result_for(em, am), &token)
            .await
            .expect("delete completes once started");

        assert!(token.is_cancelled());
        assert!(outcome.entity_map_deleted);
        assert!(!service.inner.has_attribute_map(am));
        assert!(!service.inner.has_entity_map(em));
    }

    #[test]
    fn orphan_check_is_a_single_row_page() {
        let id = Uuid::new_v4();
        let q = remaining_children_query(id);
        let page = q.page_info.expect("paging");
        assert_eq!((page.count, page.page_number), (1, 1));
        assert_eq!(q.criteria.conditions[0].value, Some(id.to_string()));
    }
}
