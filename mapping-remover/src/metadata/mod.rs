//! Display-name cache for tables and fields.
//!
//! Scoped to one lookup session. Labels are append-only; a table's field picker items are
//! dropped after a delete touches that table. Keys are compared case-insensitively (stored
//! lower-cased).

use crate::dataverse::requests::{
    EntityFilters, ExecuteMultipleSettings, RetrieveEntityRequest,
};
use crate::dataverse::{OrganizationRequest, OrganizationResponse, OrganizationService};
use crate::error::{ServiceError, ServiceResult};
use crate::models::mapping::{AttributeItem, EntityItem};
use crate::utils::cancel;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BATCH_SIZE: usize = 100;

pub struct MetadataCache {
    service: Arc<dyn OrganizationService>,
    batch_size: usize,
    entity_labels: RwLock<HashMap<String, String>>,
    attribute_labels: RwLock<HashMap<String, HashMap<String, String>>>,
    attribute_items: RwLock<HashMap<String, Vec<AttributeItem>>>,
}

impl MetadataCache {
    pub fn new(service: Arc<dyn OrganizationService>, batch_size: usize) -> Self {
        Self {
            service,
            batch_size: batch_size.max(1),
            entity_labels: RwLock::new(HashMap::new()),
            attribute_labels: RwLock::new(HashMap::new()),
            attribute_items: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve labels for every uncached table in `names`, `batch_size` tables per
    /// ExecuteMultiple. A faulted item caches its logical name as the label.
    pub async fn ensure_entity_display_names(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        let needed = {
            let cached = self.entity_labels.read().await;
            let mut seen = HashSet::new();
            names
                .iter()
                .map(|n| n.trim())
                .filter(|n| !n.is_empty())
                .filter(|n| seen.insert(n.to_lowercase()))
                .filter(|n| !cached.contains_key(&n.to_lowercase()))
                .map(str::to_string)
                .collect::<Vec<_>>()
        };
        if needed.is_empty() {
            return Ok(());
        }

        info!(
            "[PHASE: metadata] [STEP: entity_labels] Resolving {} table label(s) in batches of {}",
            needed.len(),
            self.batch_size
        );

        for chunk in needed.chunks(self.batch_size) {
            cancel::check(cancel)?;
            let requests = chunk
                .iter()
                .map(|n| {
                    OrganizationRequest::RetrieveEntity(RetrieveEntityRequest::new(
                        n.clone(),
                        EntityFilters::Entity,
                    ))
                })
                .collect();
            let response = self
                .service
                .execute(
                    OrganizationRequest::ExecuteMultiple {
                        requests,
                        settings: ExecuteMultipleSettings {
                            continue_on_error: true,
                            return_responses: true,
                        },
                    },
                    cancel,
                )
                .await?;
            cancel::check(cancel)?;

            let OrganizationResponse::ExecuteMultiple { responses, .. } = response else {
                return Err(ServiceError::remote(
                    "ExecuteMultiple returned an unexpected response",
                ));
            };

            let mut resolved: HashMap<String, String> = HashMap::new();
            for item in responses {
                let Some(requested) = chunk.get(item.request_index) else {
                    continue;
                };
                let label = match (&item.fault, &item.response) {
                    (None, Some(OrganizationResponse::RetrieveEntity(md))) => md.label_or_logical(),
                    (fault, _) => {
                        debug!(
                            "[PHASE: metadata] [STEP: entity_labels] {} falls back to logical name: {}",
                            requested,
                            fault.as_deref().unwrap_or("no response")
                        );
                        requested.clone()
                    }
                };
                resolved.insert(requested.to_lowercase(), label);
            }
            // Items the server never answered fall back too.
            for requested in chunk {
                resolved
                    .entry(requested.to_lowercase())
                    .or_insert_with(|| requested.clone());
            }

            let mut cached = self.entity_labels.write().await;
            for (k, v) in resolved {
                cached.entry(k).or_insert(v);
            }
        }
        Ok(())
    }

    /// Cache the column labels of `table`. Blank or already cached tables are skipped.
    pub async fn ensure_attribute_display_names(
        &self,
        table: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        let key = table.trim().to_lowercase();
        if key.is_empty() || self.attribute_labels.read().await.contains_key(&key) {
            return Ok(());
        }

        cancel::check(cancel)?;
        let response = self
            .service
            .execute(
                OrganizationRequest::RetrieveEntity(RetrieveEntityRequest::new(
                    key.clone(),
                    EntityFilters::Attributes,
                )),
                cancel,
            )
            .await?;
        cancel::check(cancel)?;

        let OrganizationResponse::RetrieveEntity(md) = response else {
            return Err(ServiceError::remote(
                "RetrieveEntity returned an unexpected response",
            ));
        };

        let labels = md
            .attributes
            .iter()
            .map(|a| (a.logical_name.to_lowercase(), a.label_or_logical()))
            .collect::<HashMap<_, _>>();
        debug!(
            "[PHASE: metadata] [STEP: attribute_labels] Cached {} column label(s) for {}",
            labels.len(),
            key
        );
        self.attribute_labels
            .write()
            .await
            .entry(key)
            .or_insert(labels);
        Ok(())
    }

    pub async fn entity_display_name(&self, logical_name: &str) -> String {
        self.entity_labels
            .read()
            .await
            .get(&logical_name.trim().to_lowercase())
            .cloned()
            .unwrap_or_else(|| logical_name.to_string())
    }

    pub async fn attribute_display_name(&self, table: &str, logical_name: &str) -> String {
        self.attribute_labels
            .read()
            .await
            .get(&table.trim().to_lowercase())
            .and_then(|m| m.get(&logical_name.trim().to_lowercase()))
            .cloned()
            .unwrap_or_else(|| logical_name.to_string())
    }

    /// Table picker items, sorted by logical name.
    pub async fn entity_items(&self, names: &[String]) -> Vec<EntityItem> {
        let mut items = Vec::with_capacity(names.len());
        for name in names {
            items.push(EntityItem {
                logical_name: name.clone(),
                display_name: self.entity_display_name(name).await,
            });
        }
        items.sort_by_key(|i| i.logical_name.to_lowercase());
        items
    }

    /// Field picker items for `table`, sorted by display name. Stored for reuse.
    pub async fn build_attribute_items(&self, table: &str, fields: &[String]) -> Vec<AttributeItem> {
        let mut items = Vec::with_capacity(fields.len());
        for field in fields {
            items.push(AttributeItem {
                logical_name: field.clone(),
                display_name: self.attribute_display_name(table, field).await,
            });
        }
        items.sort_by(|a, b| a.display_name.cmp(&b.display_name));

        let key = table.trim().to_lowercase();
        if !key.is_empty() {
            self.attribute_items
                .write()
                .await
                .entry(key)
                .or_insert_with(|| items.clone());
        }
        items
    }

    pub async fn cached_attribute_items(&self, table: &str) -> Option<Vec<AttributeItem>> {
        self.attribute_items
            .read()
            .await
            .get(&table.trim().to_lowercase())
            .cloned()
    }

    /// Drop the stored field picker items for `table` so the next load lists it again.
    pub async fn forget_attribute_items(&self, table: &str) {
        self.attribute_items
            .write()
            .await
            .remove(&table.trim().to_lowercase());
    }

    pub async fn cached_entity_count(&self) -> usize {
        self.entity_labels.read().await.len()
    }
}

/// Log and swallow a label lookup failure so the pickers still fill with logical names.
pub fn tolerate(result: ServiceResult<()>, what: &str) -> ServiceResult<()> {
    match result {
        Err(ServiceError::Cancelled) => Err(ServiceError::Cancelled),
        Err(e) => {
            warn!(
                "[PHASE: metadata] [STEP: {}] Label lookup failed, showing logical names: {}",
                what, e
            );
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}
