// Dataverse Web API implementation of OrganizationService.

use super::batch;
use super::entity::{Entity, EntityCollection};
use super::fetchxml;
use super::query::QueryExpression;
use super::requests::{
    EntityFilters, EntityMetadata, ExecuteMultipleResponseItem, ExecuteMultipleSettings,
    OrganizationRequest, OrganizationResponse, RetrieveEntityRequest,
};
use super::OrganizationService;
use crate::auth::AccessTokenSource;
use crate::error::{ServiceError, ServiceResult};
use crate::utils::cancel;
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

pub struct WebApiClient {
    http: reqwest::Client,
    api_root: String,
    tokens: Arc<dyn AccessTokenSource>,
}

#[derive(Deserialize)]
struct ODataCollection {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(rename = "@Microsoft.Dynamics.CRM.morerecords", default)]
    more_records: bool,
}

impl WebApiClient {
    pub fn new(
        environment_url: &str,
        api_version: &str,
        timeout: Duration,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::remote(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_root: api_root(environment_url, api_version),
            tokens,
        })
    }

    pub fn api_root(&self) -> &str {
        &self.api_root
    }

    /// Calling user's id; doubles as a connection check after sign-in.
    pub async fn who_am_i(&self, cancel: &CancellationToken) -> ServiceResult<Uuid> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct WhoAmIResponse {
            user_id: Uuid,
        }

        let url = self.parse_url(&format!("{}/WhoAmI", self.api_root))?;
        let resp = self
            .send(self.http.get(url).header(ACCEPT, "application/json"), cancel)
            .await?;
        let text = cancel::run(cancel, async { Ok(resp.text().await?) }).await?;
        let who: WhoAmIResponse = serde_json::from_str(&text)?;
        debug!("[PHASE: dataverse] [STEP: who_am_i] UserId={}", who.user_id);
        Ok(who.user_id)
    }

    fn parse_url(&self, url: &str) -> ServiceResult<Url> {
        Url::parse(url).map_err(|e| ServiceError::InvalidArgument(format!("Invalid URL {}: {}", url, e)))
    }

    fn metadata_url(&self, request: &RetrieveEntityRequest) -> ServiceResult<Url> {
        let name = request.logical_name.trim().replace('\'', "''");
        let mut url = self.parse_url(&format!(
            "{}/EntityDefinitions(LogicalName='{}')",
            self.api_root, name
        ))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("$select", "LogicalName,DisplayName");
            if request.entity_filters == EntityFilters::Attributes {
                q.append_pair("$expand", "Attributes($select=LogicalName,DisplayName)");
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        cancel: &CancellationToken,
    ) -> ServiceResult<Response> {
        let token = self.tokens.access_token(cancel).await?;
        cancel::run(cancel, async {
            let resp = builder
                .bearer_auth(token)
                .header("OData-MaxVersion", "4.0")
                .header("OData-Version", "4.0")
                .send()
                .await?;
            ensure_success(resp).await
        })
        .await
    }

    async fn retrieve_entity(
        &self,
        request: &RetrieveEntityRequest,
        cancel: &CancellationToken,
    ) -> ServiceResult<EntityMetadata> {
        let url = self.metadata_url(request)?;
        debug!(
            "[PHASE: dataverse] [STEP: retrieve_entity] {} ({:?})",
            request.logical_name, request.entity_filters
        );
        let resp = self
            .send(self.http.get(url).header(ACCEPT, "application/json"), cancel)
            .await?;
        let text = cancel::run(cancel, async { Ok(resp.text().await?) }).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn execute_multiple(
        &self,
        requests: &[OrganizationRequest],
        settings: ExecuteMultipleSettings,
        cancel: &CancellationToken,
    ) -> ServiceResult<OrganizationResponse> {
        let mut urls = Vec::with_capacity(requests.len());
        for r in requests {
            match r {
                OrganizationRequest::RetrieveEntity(inner) => {
                    urls.push(self.metadata_url(inner)?.to_string())
                }
                other => {
                    return Err(ServiceError::InvalidArgument(format!(
                        "{} cannot be nested in ExecuteMultiple",
                        other.name()
                    )))
                }
            }
        }
        if urls.is_empty() {
            return Ok(OrganizationResponse::ExecuteMultiple {
                responses: Vec::new(),
                is_faulted: false,
            });
        }

        let boundary = format!("batch_{}", Uuid::new_v4());
        let body = batch::encode_get_batch(&boundary, &urls);
        let url = self.parse_url(&format!("{}/$batch", self.api_root))?;

        let mut builder = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .header(
                CONTENT_TYPE,
                format!("multipart/mixed; boundary={}", boundary),
            )
            .body(body);
        if settings.continue_on_error {
            builder = builder.header("Prefer", "odata.continue-on-error");
        }

        info!(
            "[PHASE: dataverse] [STEP: execute_multiple] Sending batch of {} request(s)",
            urls.len()
        );
        let resp = self.send(builder, cancel).await?;
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let text = cancel::run(cancel, async { Ok(resp.text().await?) }).await?;

        let response_boundary = batch::boundary_from_content_type(&content_type)
            .ok_or_else(|| ServiceError::remote("Batch response is missing its multipart boundary"))?;
        let parts = batch::decode_batch_response(&response_boundary, &text)?;

        let mut responses = Vec::with_capacity(requests.len());
        let mut is_faulted = false;
        for index in 0..requests.len() {
            let item = match parts.get(index) {
                Some(part) if part.is_success() => {
                    match serde_json::from_str::<EntityMetadata>(&part.body) {
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
                            fault: Some(format!("Unexpected metadata payload: {}", e)),
                        },
                    }
                }
                Some(part) if part.status == batch::BatchPart::MALFORMED => {
                    ExecuteMultipleResponseItem {
                        request_index: index,
                        response: None,
                        fault: Some("Batch response part has no HTTP status line".to_string()),
                    }
                }
                Some(part) => {
                    let (code, message) = batch::odata_error(&part.body);
                    ExecuteMultipleResponseItem {
                        request_index: index,
                        response: None,
                        fault: Some(
                            format!(
                                "{} (HTTP {}{})",
                                message.unwrap_or_else(|| "Request failed".to_string()),
                                part.status,
                                code.map(|c| format!(", {}", c)).unwrap_or_default()
                            ),
                        ),
                    }
                }
                None => ExecuteMultipleResponseItem {
                    request_index: index,
                    response: None,
                    fault: Some("Request was not executed".to_string()),
                },
            };
            if item.fault.is_some() {
                is_faulted = true;
            }
            responses.push(item);
        }

        if is_faulted {
            warn!(
                "[PHASE: dataverse] [STEP: execute_multiple] {} of {} batched request(s) faulted",
                responses.iter().filter(|r| r.fault.is_some()).count(),
                responses.len()
            );
        }

        Ok(OrganizationResponse::ExecuteMultiple {
            responses,
            is_faulted,
        })
    }
}

#[async_trait]
impl OrganizationService for WebApiClient {
    async fn retrieve_multiple(
        &self,
        query: &QueryExpression,
        cancel: &CancellationToken,
    ) -> ServiceResult<EntityCollection> {
        let set = entity_set_name(&query.entity_name);
        let fetch = fetchxml::render(query);
        let mut url = self.parse_url(&format!("{}/{}", self.api_root, set))?;
        url.query_pairs_mut().append_pair("fetchXml", &fetch);

        debug!(
            "[PHASE: dataverse] [STEP: retrieve_multiple] {} fetchXml={}",
            query.entity_name, fetch
        );
        let resp = self
            .send(
                self.http
                    .get(url)
                    .header(ACCEPT, "application/json")
                    .header(
                        "Prefer",
                        "odata.include-annotations=\"Microsoft.Dynamics.CRM.*\"",
                    ),
                cancel,
            )
            .await?;
        let text = cancel::run(cancel, async { Ok(resp.text().await?) }).await?;
        let page: ODataCollection = serde_json::from_str(&text)?;

        let entities = page
            .value
            .into_iter()
            .map(|v| Entity::from_json(&query.entity_name, v))
            .collect::<Vec<_>>();
        debug!(
            "[PHASE: dataverse] [STEP: retrieve_multiple] {} row(s) from {}",
            entities.len(),
            query.entity_name
        );
        if page.more_records && query.page_info.is_none() {
            warn!(
                "[PHASE: dataverse] [STEP: retrieve_multiple] {} has more rows than one page; only the first page is used",
                query.entity_name
            );
        }
        Ok(EntityCollection {
            entity_name: query.entity_name.clone(),
            entities,
            more_records: page.more_records,
        })
    }

    async fn execute(
        &self,
        request: OrganizationRequest,
        cancel: &CancellationToken,
    ) -> ServiceResult<OrganizationResponse> {
        match request {
            OrganizationRequest::RetrieveEntity(inner) => {
                let md = self.retrieve_entity(&inner, cancel).await?;
                Ok(OrganizationResponse::RetrieveEntity(md))
            }
            OrganizationRequest::ExecuteMultiple { requests, settings } => {
                self.execute_multiple(&requests, settings, cancel).await
            }
        }
    }

    async fn delete(
        &self,
        entity_name: &str,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> ServiceResult<()> {
        let url = self.parse_url(&format!(
            "{}/{}({})",
            self.api_root,
            entity_set_name(entity_name),
            id
        ))?;
        info!(
            "[PHASE: dataverse] [STEP: delete] Deleting {} {}",
            entity_name, id
        );
        self.send(self.http.delete(url), cancel).await?;
        Ok(())
    }
}

async fn ensure_success(resp: Response) -> ServiceResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let (code, message) = batch::odata_error(&body);
    let message = message.unwrap_or_else(|| {
        format!(
            "Dataverse request failed: {}",
            status.canonical_reason().unwrap_or("unknown status")
        )
    });
    Err(ServiceError::remote_status(status.as_u16(), code, message))
}

pub fn api_root(environment_url: &str, api_version: &str) -> String {
    format!(
        "{}/api/data/{}",
        environment_url.trim().trim_end_matches('/'),
        api_version.trim().trim_matches('/')
    )
}

/// Web API entity set name for a table logical name.
pub fn entity_set_name(logical_name: &str) -> String {
    let name = logical_name.trim().to_lowercase();
    let ends_with_consonant_y = name.ends_with('y')
        && !matches!(
            name.chars().rev().nth(1),
            Some('a' | 'e' | 'i' | 'o' | 'u')
        );
    if ends_with_consonant_y {
        format!("{}ies", &name[..name.len() - 1])
    } else if name.ends_with('s')
        || name.ends_with('x')
        || name.ends_with("ch")
        || name.ends_with("sh")
    {
        format!("{}es", name)
    } else {
        format!("{}s", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    #[test]
    fn entity_set_names_follow_web_api_pluralization() {
        assert_eq!(entity_set_name("attributemap"), "attributemaps");
        assert_eq!(entity_set_name("entitymap"), "entitymaps");
        assert_eq!(entity_set_name("opportunity"), "opportunities");
        assert_eq!(entity_set_name("address"), "addresses");
        assert_eq!(entity_set_name("survey"), "surveys");
    }

    #[test]
    fn api_root_normalizes_slashes() {
        assert_eq!(
            api_root("https://org.crm.dynamics.com/", "/v9.2/"),
            "https://org.crm.dynamics.com/api/data/v9.2"
        );
    }

    #[test]
    fn metadata_url_expands_attributes_only_when_requested() {
        let client = WebApiClient::new(
            "https://org.crm.dynamics.com",
            "v9.2",
            Duration::from_secs(5),
            Arc::new(StaticToken::new("t")),
        )
        .expect("client");

        let entity_only = client
            .metadata_url(&RetrieveEntityRequest::new("contact", EntityFilters::Entity))
            .expect("url")
            .to_string();
        assert!(entity_only
            .starts_with("https://org.crm.dynamics.com/api/data/v9.2/EntityDefinitions(LogicalName='contact')?"));
        assert!(!entity_only.contains("expand"));

        let with_attrs = client
            .metadata_url(&RetrieveEntityRequest::new("contact", EntityFilters::Attributes))
            .expect("url")
            .to_string();
        assert!(with_attrs.contains("%24expand=Attributes"));
    }
}
