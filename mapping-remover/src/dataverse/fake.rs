// In-memory OrganizationService for tests.
//
// Holds a tiny entitymap / attributemap store plus table metadata and evaluates the subset of
// QueryExpression the mapping services issue: eq conditions, inner/outer links, distinct, and
// a page count.

use super::entity::{Entity, EntityCollection};
use super::query::{ColumnSet, ConditionOperator, FilterExpression, JoinOperator, QueryExpression};
use super::requests::{
    AttributeMetadata, EntityFilters, EntityMetadata, ExecuteMultipleResponseItem, Label,
    LocalizedLabel, OrganizationRequest, OrganizationResponse,
};
use super::{OrganizationService, ATTRIBUTE_MAP, ENTITY_MAP};
use crate::error::{ServiceError, ServiceResult};
use crate::utils::cancel;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
struct FakeState {
    entity_maps: Vec<(Uuid, String, String)>,
    attribute_maps: Vec<(Uuid, Uuid, String, String)>,
    metadata: HashMap<String, (String, Vec<(String, String)>)>,
    faulted_metadata: HashSet<String>,
    failing_deletes: HashSet<String>,
    cancel_on_retrieve: Option<(u32, CancellationToken)>,
    batch_sizes: Vec<usize>,
    deleted: Vec<(String, Uuid)>,
}

#[derive(Default)]
pub struct FakeOrganizationService {
    state: Mutex<FakeState>,
    pub retrieve_calls: AtomicU32,
    pub execute_calls: AtomicU32,
    pub delete_calls: AtomicU32,
}

impl FakeOrganizationService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_entity_map(&self, source_entity: &str, target_entity: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state()
            .entity_maps
            .push((id, source_entity.to_string(), target_entity.to_string()));
        id
    }

    pub fn add_attribute_map(
        &self,
        entity_map_id: Uuid,
        source_attribute: &str,
        target_attribute: &str,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.state().attribute_maps.push((
            id,
            entity_map_id,
            source_attribute.to_string(),
            target_attribute.to_string(),
        ));
        id
    }

    pub fn add_entity_metadata(&self, logical_name: &str, display_name: &str) {
        self.state()
            .metadata
            .entry(logical_name.to_lowercase())
            .or_insert_with(|| (String::new(), Vec::new()))
            .0 = display_name.to_string();
    }

    pub fn add_attribute_metadata(&self, table: &str, attribute: &str, display_name: &str) {
        self.state()
            .metadata
            .entry(table.to_lowercase())
            .or_insert_with(|| (String::new(), Vec::new()))
            .1
            .push((attribute.to_string(), display_name.to_string()));
    }

    /// Metadata requests for `logical_name` fault.
    pub fn fault_metadata(&self, logical_name: &str) {
        self.state()
            .faulted_metadata
            .insert(logical_name.to_lowercase());
    }

    /// Deletes of `entity_name` records fail with HTTP 403.
    pub fn fail_deletes_of(&self, entity_name: &str) {
        self.state().failing_deletes.insert(entity_name.to_string());
    }

    /// Fire `token` while serving the `call`-th retrieve_multiple (1-based).
    pub fn cancel_on_retrieve(&self, call: u32, token: CancellationToken) {
        self.state().cancel_on_retrieve = Some((call, token));
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state().batch_sizes.clone()
    }

    pub fn deleted(&self) -> Vec<(String, Uuid)> {
        self.state().deleted.clone()
    }

    pub fn has_entity_map(&self, id: Uuid) -> bool {
        self.state().entity_maps.iter().any(|e| e.0 == id)
    }

    pub fn has_attribute_map(&self, id: Uuid) -> bool {
        self.state().attribute_maps.iter().any(|a| a.0 == id)
    }

    fn records(state: &FakeState, entity_name: &str) -> Vec<Map<String, Value>> {
        let rows: Vec<Value> = match entity_name {
            ENTITY_MAP => state
                .entity_maps
                .iter()
                .map(|(id, s, t)| {
                    json!({
                        "entitymapid": id.to_string(),
                        "sourceentityname": s,
                        "targetentityname": t,
                    })
                })
                .collect(),
            ATTRIBUTE_MAP => state
                .attribute_maps
                .iter()
                .map(|(id, parent, s, t)| {
                    json!({
                        "attributemapid": id.to_string(),
                        "_entitymapid_value": parent.to_string(),
                        "sourceattributename": s,
                        "targetattributename": t,
                    })
                })
                .collect(),
            _ => Vec::new(),
        };
        rows.into_iter()
            .filter_map(|v| match v {
                Value::Object(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn metadata_for(
        state: &FakeState,
        logical_name: &str,
        filters: EntityFilters,
    ) -> ServiceResult<EntityMetadata> {
        let key = logical_name.to_lowercase();
        if state.faulted_metadata.contains(&key) {
            return Err(ServiceError::remote_status(
                500,
                Some("0x80040216".to_string()),
                format!("Metadata for {} is unavailable", logical_name),
            ));
        }
        let (display, attrs) = state.metadata.get(&key).ok_or_else(|| {
            ServiceError::remote_status(
                404,
                Some("0x80060888".to_string()),
                format!("Could not find entity with name {}", logical_name),
            )
        })?;
        let attributes = match filters {
            EntityFilters::Entity => Vec::new(),
            EntityFilters::Attributes => attrs
                .iter()
                .map(|(name, label)| AttributeMetadata {
                    logical_name: name.clone(),
                    display_name: Some(label_of(label)),
                })
                .collect(),
        };
        Ok(EntityMetadata {
            logical_name: key,
            display_name: Some(label_of(display)),
            attributes,
        })
    }
}

fn label_of(text: &str) -> Label {
    Label {
        user_localized_label: Some(LocalizedLabel {
            label: text.to_string(),
        }),
    }
}

fn field<'a>(record: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    record
        .get(name)
        .or_else(|| record.get(&format!("_{}_value", name)))
}

fn matches_filter(record: &Map<String, Value>, filter: &FilterExpression) -> bool {
    filter.conditions.iter().all(|c| {
        let actual = field(record, &c.attribute).and_then(Value::as_str);
        match c.operator {
            ConditionOperator::Null => actual.is_none(),
            ConditionOperator::NotNull => actual.is_some(),
            ConditionOperator::Equal | ConditionOperator::NotEqual => {
                let eq = match (actual, c.value.as_deref()) {
                    (Some(a), Some(v)) => a.eq_ignore_ascii_case(v),
                    _ => false,
                };
                (c.operator == ConditionOperator::Equal) == eq
            }
        }
    })
}

fn project(
    record: &Map<String, Value>,
    columns: &ColumnSet,
    prefix: Option<&str>,
    out: &mut Map<String, Value>,
) {
    let names: Vec<String> = match columns {
        ColumnSet::All => record.keys().cloned().collect(),
        ColumnSet::Columns(c) => c.clone(),
    };
    for name in names {
        let (key, value) = match (record.get(&name), record.get(&format!("_{}_value", name))) {
            (Some(v), _) => (name.clone(), v.clone()),
            (None, Some(v)) if prefix.is_none() => (format!("_{}_value", name), v.clone()),
            (None, Some(v)) => (name.clone(), v.clone()),
            (None, None) => continue,
        };
        let key = match prefix {
            Some(p) => format!("{}.{}", p, key),
            None => key,
        };
        out.insert(key, value);
    }
}

#[async_trait]
impl OrganizationService for FakeOrganizationService {
    async fn retrieve_multiple(
        &self,
        query: &QueryExpression,
        cancel: &CancellationToken,
    ) -> ServiceResult<EntityCollection> {
        cancel::check(cancel)?;
        let call = self.retrieve_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let state = self.state();

        if let Some((at, token)) = &state.cancel_on_retrieve {
            if *at == call {
                token.cancel();
            }
        }

        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        for base in Self::records(&state, &query.entity_name) {
            if !matches_filter(&base, &query.criteria) {
                continue;
            }
            let mut out = Map::new();
            project(&base, &query.column_set, None, &mut out);

            let mut keep = true;
            for link in &query.link_entities {
                let parent_key = field(&base, &link.link_from_attribute).and_then(Value::as_str);
                let linked = Self::records(&state, &link.link_to_entity)
                    .into_iter()
                    .find(|r| {
                        field(r, &link.link_to_attribute).and_then(Value::as_str) == parent_key
                            && parent_key.is_some()
                            && matches_filter(r, &link.link_criteria)
                    });
                match (linked, link.join) {
                    (Some(r), _) => project(&r, &link.columns, Some(link.alias.as_deref().unwrap_or(&link.link_to_entity)), &mut out),
                    (None, JoinOperator::Inner) => keep = false,
                    (None, JoinOperator::LeftOuter) => {}
                }
            }
            if !keep {
                continue;
            }

            if query.distinct {
                if !seen.insert(Value::Object(out.clone()).to_string()) {
                    continue;
                }
            } else {
                let id_key = format!("{}id", query.entity_name);
                if let Some(id) = base.get(&id_key) {
                    out.insert(id_key, id.clone());
                }
            }
            rows.push(Entity::from_json(&query.entity_name, Value::Object(out)));
        }

        let mut more_records = false;
        if let Some(page) = query.page_info {
            let count = page.count.max(1) as usize;
            let skip = count * (page.page_number.max(1) as usize - 1);
            more_records = rows.len() > skip + count;
            rows = rows.into_iter().skip(skip).take(count).collect();
        }

        Ok(EntityCollection {
            entity_name: query.entity_name.clone(),
            entities: rows,
            more_records,
        })
    }

    async fn execute(
        &self,
        request: OrganizationRequest,
        cancel: &CancellationToken,
    ) -> ServiceResult<OrganizationResponse> {
        cancel::check(cancel)?;
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        match request {
            OrganizationRequest::RetrieveEntity(r) => Ok(OrganizationResponse::RetrieveEntity(
                Self::metadata_for(&state, &r.logical_name, r.entity_filters)?,
            )),
            OrganizationRequest::ExecuteMultiple { requests, settings } => {
                state.batch_sizes.push(requests.len());
                let mut responses = Vec::with_capacity(requests.len());
                let mut is_faulted = false;
                for (index, r) in requests.into_iter().enumerate() {
                    if is_faulted && !settings.continue_on_error {
                        break;
                    }
                    let item = match r {
                        OrganizationRequest::RetrieveEntity(inner) => {
                            match Self::metadata_for(&state, &inner.logical_name, inner.entity_filters) {
                                Ok(md) => ExecuteMultipleResponseItem {
                                    request_index: index,
                                    response: settings
                                        .return_responses
                                        .then_some(OrganizationResponse::RetrieveEntity(md)),
                                    fault: None,
                                },
                                Err(e) => ExecuteMultipleResponseItem {
                                    request_index: index,
                                    response: None,
                                    fault: Some(e.to_string()),
                                },
                            }
                        }
                        other => ExecuteMultipleResponseItem {
                            request_index: index,
                            response: None,
                            fault: Some(format!("{} cannot be nested", other.name())),
                        },
                    };
                    is_faulted |= item.fault.is_some();
                    responses.push(item);
                }
                Ok(OrganizationResponse::ExecuteMultiple {
                    responses,
                    is_faulted,
                })
            }
        }
    }

    async fn delete(
        &self,
        entity_name: &str,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        cancel::check(cancel)?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.failing_deletes.contains(entity_name) {
            return Err(ServiceError::remote_status(
                403,
                Some("0x80040220".to_string()),
                format!("Principal user is missing delete privilege on {}", entity_name),
            ));
        }
        let removed = match entity_name {
            ENTITY_MAP => {
                let before = state.entity_maps.len();
                state.entity_maps.retain(|e| e.0 != id);
                before != state.entity_maps.len()
            }
            ATTRIBUTE_MAP => {
                let before = state.attribute_maps.len();
                state.attribute_maps.retain(|a| a.0 != id);
                before != state.attribute_maps.len()
            }
            _ => false,
        };
        if !removed {
            return Err(ServiceError::remote_status(
                404,
                None,
                format!("{} With Id = {} Does Not Exist", entity_name, id),
            ));
        }
        state.deleted.push((entity_name.to_string(), id));
        Ok(())
    }
}
