//! Dataverse access.
//!
//! `OrganizationService` is the only seam the mapping logic depends on: the three operations
//! this tool actually needs. `WebApiClient` implements it over the Dataverse Web API; tests use
//! the in-memory `fake::FakeOrganizationService`.

pub mod batch;
pub mod entity;
pub mod fetchxml;
pub mod query;
pub mod requests;
pub mod web_api;

#[cfg(test)]
pub mod fake;

use crate::error::ServiceResult;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use entity::{Entity, EntityCollection};
pub use query::{ColumnSet, ConditionOperator, JoinOperator, LinkEntity, QueryExpression};
pub use requests::{OrganizationRequest, OrganizationResponse};
pub use web_api::WebApiClient;

/// Logical names of the records this tool reads and deletes.
pub const ATTRIBUTE_MAP: &str = "attributemap";
pub const ENTITY_MAP: &str = "entitymap";

#[async_trait]
pub trait OrganizationService: Send + Sync {
    async fn retrieve_multiple(
        &self,
        query: &QueryExpression,
        cancel: &CancellationToken,
    ) -> ServiceResult<EntityCollection>;

    async fn execute(
        &self,
        request: OrganizationRequest,
        cancel: &CancellationToken,
    ) -> ServiceResult<OrganizationResponse>;

    async fn delete(
        &self,
        entity_name: &str,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> ServiceResult<()>;
}
