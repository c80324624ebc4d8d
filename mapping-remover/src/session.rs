// Mapping lookup controller
//
// Owns the metadata cache, the catalog, the inspector and the delete workflow for one
// connected environment. Each operation kind has one cancellation slot: starting a new
// operation cancels the previous one of the same kind, and results carry the generation
// they were started with so stale ones can be dropped by the UI.

use crate::dataverse::OrganizationService;
use crate::error::{ServiceError, ServiceResult};
use crate::mapping::{delete_mapping, MappingCatalog, MappingInspectorService};
use crate::metadata::{self, MetadataCache};
use crate::models::mapping::{AttributeItem, DeleteOutcome, EntityItem, MappingResult};
use crate::utils::cancel;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Entities,
    Attributes,
    Search,
    Delete,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Entities,
        OperationKind::Attributes,
        OperationKind::Search,
        OperationKind::Delete,
    ];
}

/// Handle for one started operation.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub kind: OperationKind,
    pub generation: u64,
    pub token: CancellationToken,
}

#[derive(Default)]
pub struct OperationSlots {
    next: AtomicU64,
    slots: Mutex<HashMap<OperationKind, (u64, CancellationToken)>>,
}

impl OperationSlots {
    fn lock(&self) -> MutexGuard<'_, HashMap<OperationKind, (u64, CancellationToken)>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start a new operation of `kind`, cancelling the one it replaces.
    pub fn begin(&self, kind: OperationKind) -> Ticket {
        let generation = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        if let Some((old_gen, old)) = self.lock().insert(kind, (generation, token.clone())) {
            debug!(
                "[PHASE: session] [STEP: begin] {:?} #{} replaces #{}",
                kind, generation, old_gen
            );
            old.cancel();
        }
        Ticket {
            kind,
            generation,
            token,
        }
    }

    pub fn is_current(&self, ticket: &Ticket) -> bool {
        !ticket.token.is_cancelled()
            && self
                .lock()
                .get(&ticket.kind)
                .is_some_and(|(g, _)| *g == ticket.generation)
    }

    /// Release the slot if `ticket` still owns it.
    pub fn finish(&self, ticket: &Ticket) {
        let mut slots = self.lock();
        if slots
            .get(&ticket.kind)
            .is_some_and(|(g, _)| *g == ticket.generation)
        {
            slots.remove(&ticket.kind);
        }
    }

    pub fn cancel(&self, kind: OperationKind) -> bool {
        match self.lock().remove(&kind) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, (_, token)) in self.lock().drain() {
            token.cancel();
        }
    }

    pub fn is_running(&self, kind: OperationKind) -> bool {
        self.lock().contains_key(&kind)
    }
}

/// Field picker items for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeLoad {
    pub table: String,
    pub items: Vec<AttributeItem>,
    pub from_cache: bool,
}

pub struct LookupSession {
    service: Arc<dyn OrganizationService>,
    inspector: MappingInspectorService,
    catalog: MappingCatalog,
    metadata: Arc<MetadataCache>,
    slots: OperationSlots,
}

impl LookupSession {
    pub fn new(service: Arc<dyn OrganizationService>, metadata: Arc<MetadataCache>) -> Self {
        Self {
            inspector: MappingInspectorService::new(service.clone()),
            catalog: MappingCatalog::new(service.clone()),
            service,
            metadata,
            slots: OperationSlots::default(),
        }
    }

    pub fn begin(&self, kind: OperationKind) -> Ticket {
        self.slots.begin(kind)
    }

    pub fn is_current(&self, ticket: &Ticket) -> bool {
        self.slots.is_current(ticket)
    }

    pub fn finish(&self, ticket: &Ticket) {
        self.slots.finish(ticket)
    }

    pub fn cancel(&self, kind: OperationKind) -> bool {
        self.slots.cancel(kind)
    }

    pub fn cancel_all(&self) {
        self.slots.cancel_all()
    }

    pub fn is_running(&self, kind: OperationKind) -> bool {
        self.slots.is_running(kind)
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    /// Tables that take part in a mapping, labelled where metadata allows.
    pub async fn load_entities(&self, ticket: &Ticket) -> ServiceResult<Vec<EntityItem>> {
        let names = self.catalog.list_mapped_entities(&ticket.token).await?;
        metadata::tolerate(
            self.metadata
                .ensure_entity_display_names(&names, &ticket.token)
                .await,
            "entity_labels",
        )?;
        cancel::check(&ticket.token)?;
        let items = self.metadata.entity_items(&names).await;
        info!(
            "[PHASE: session] [STEP: load_entities] {} mapped table(s) loaded, {} label(s) cached",
            items.len(),
            self.metadata.cached_entity_count().await
        );
        Ok(items)
    }

    /// Mapped fields of `table`, served from the per-table cache after the first load.
    pub async fn load_attributes(&self, table: &str, ticket: &Ticket) -> ServiceResult<AttributeLoad> {
        let table = table.trim().to_string();
        if let Some(items) = self.metadata.cached_attribute_items(&table).await {
            return Ok(AttributeLoad {
                table,
                items,
                from_cache: true,
            });
        }

        let fields = self
            .catalog
            .list_mapped_attributes(&table, &ticket.token)
            .await?;
        metadata::tolerate(
            self.metadata
                .ensure_attribute_display_names(&table, &ticket.token)
                .await,
            "attribute_labels",
        )?;
        cancel::check(&ticket.token)?;
        let items = self.metadata.build_attribute_items(&table, &fields).await;
        Ok(AttributeLoad {
            table,
            items,
            from_cache: false,
        })
    }

    pub async fn search(
        &self,
        table: &str,
        field: &str,
        ticket: &Ticket,
    ) -> ServiceResult<Vec<MappingResult>> {
        self.inspector
            .find_attribute_mappings(table, field, &ticket.token)
            .await
    }

    /// Guarded delete. The field lists of both tables are reloaded on their next use, since
    /// the child may be gone even when a later step fails.
    pub async fn delete(&self, mapping: &MappingResult, ticket: &Ticket) -> ServiceResult<DeleteOutcome> {
        let result = delete_mapping(self.service.as_ref(), mapping, &ticket.token).await;
        if !matches!(result, Err(ServiceError::Cancelled)) {
            self.metadata
                .forget_attribute_items(&mapping.source_entity)
                .await;
            self.metadata
                .forget_attribute_items(&mapping.target_entity)
                .await;
        }
        result
    }
}

/// Status line text for a finished search.
pub fn search_status(count: usize) -> String {
    match count {
        0 => "No mappings found".to_string(),
        1 => "Found 1 mapping".to_string(),
        n => format!("Found {} mappings", n),
    }
}
