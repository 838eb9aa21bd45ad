//! GraphQL-over-HTTPS platform client.
//!
//! One request carries a chunk of mutations as aliased fields `m0..mN`.
//! Per-alias results come back under `data`, per-alias failures under
//! `errors[].path[0]`.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value as Json};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::debug;

use super::platform::{ErrorCategory, ItemOutcome, Mutation, Platform, PlatformError};
use crate::config::PlatformConfig;
use crate::error::{Result, SyncError};

/// Column key carrying a sub-item quantity before mapping.
pub const QUANTITY_FIELD: &str = "quantity";

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Map<String, Json>>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    path: Vec<Json>,
    #[serde(default)]
    extensions: Option<Map<String, Json>>,
}

impl GraphqlError {
    fn alias(&self) -> Option<&str> {
        self.path.first().and_then(Json::as_str)
    }

    fn code(&self) -> &str {
        self.extensions
            .as_ref()
            .and_then(|e| e.get("code"))
            .and_then(Json::as_str)
            .unwrap_or("")
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::classify(self.code(), &self.message)
    }
}

/// Platform reached over HTTPS.
pub struct HttpPlatform {
    client: reqwest::Client,
    api_url: String,
    auth: HeaderValue,
    board_id: String,
    subitem_board_id: String,
    column_map: BTreeMap<String, String>,
    quantity_column: String,
    max_items_per_call: usize,
}

impl HttpPlatform {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .user_agent(concat!("order-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut auth = HeaderValue::from_str(&config.api_token)
            .map_err(|_| SyncError::Config("platform.api_token is not a valid header".into()))?;
        auth.set_sensitive(true);

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            auth,
            board_id: config.board_id.clone(),
            subitem_board_id: config.subitem_board().to_string(),
            column_map: config.column_map.clone(),
            quantity_column: config.quantity_column.clone(),
            max_items_per_call: config.max_items_per_call,
        })
    }

    /// Translate source column names to platform column ids.
    fn platform_columns(&self, columns: &BTreeMap<String, Json>) -> Json {
        let mut out = Map::new();
        for (name, value) in columns {
            if let Some(id) = self.column_map.get(name) {
                out.insert(id.clone(), value.clone());
            } else if name == QUANTITY_FIELD {
                out.insert(self.quantity_column.clone(), value.clone());
            }
        }
        Json::Object(out)
    }

    /// Build one document with an aliased field per mutation.
    fn build_document(&self, mutations: &[Mutation]) -> String {
        let mut doc = String::from("mutation {");
        for (i, m) in mutations.iter().enumerate() {
            let _ = write!(doc, " m{}: ", i);
            match m {
                Mutation::CreateItem { name, columns } => {
                    let _ = write!(
                        doc,
                        "create_item(board_id: {}, item_name: {}, column_values: {}) {{ id }}",
                        graphql_string(&self.board_id),
                        graphql_string(name),
                        graphql_json(&self.platform_columns(columns)),
                    );
                }
                Mutation::UpdateItem {
                    external_id,
                    columns,
                } => {
                    let _ = write!(
                        doc,
                        "change_multiple_column_values(board_id: {}, item_id: {}, column_values: {}) {{ id }}",
                        graphql_string(&self.board_id),
                        graphql_string(external_id),
                        graphql_json(&self.platform_columns(columns)),
                    );
                }
                Mutation::CreateSubitem {
                    parent_external_id,
                    name,
                    columns,
                } => {
                    let _ = write!(
                        doc,
                        "create_subitem(parent_item_id: {}, item_name: {}, column_values: {}) {{ id }}",
                        graphql_string(parent_external_id),
                        graphql_string(name),
                        graphql_json(&self.platform_columns(columns)),
                    );
                }
                Mutation::UpdateSubitem {
                    external_id,
                    columns,
                } => {
                    let _ = write!(
                        doc,
                        "change_multiple_column_values(board_id: {}, item_id: {}, column_values: {}) {{ id }}",
                        graphql_string(&self.subitem_board_id),
                        graphql_string(external_id),
                        graphql_json(&self.platform_columns(columns)),
                    );
                }
            }
        }
        doc.push_str(" }");
        doc
    }

    async fn post(&self, query: String) -> std::result::Result<GraphqlResponse, PlatformError> {
        let response = self
            .client
            .post(&self.api_url)
            .header(AUTHORIZATION, self.auth.clone())
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(PlatformError::RateLimited { retry_after });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PlatformError::Rejected {
                category: ErrorCategory::Unauthorized,
                message: format!("platform answered {}", status),
            });
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::Server {
                status: status.as_u16(),
                message: truncate(&body, 200),
            });
        }

        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(PlatformError::Rejected {
                category: ErrorCategory::Unknown,
                message: format!("platform answered {}: {}", status, truncate(&body, 200)),
            });
        }
        serde_json::from_str(&body).map_err(|e| PlatformError::Server {
            status: status.as_u16(),
            message: format!("undecodable response: {}", e),
        })
    }
}

#[async_trait]
impl Platform for HttpPlatform {
    async fn execute(
        &self,
        mutations: &[Mutation],
    ) -> std::result::Result<Vec<ItemOutcome>, PlatformError> {
        if mutations.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.build_document(mutations);
        debug!("sending {} mutations ({} bytes)", mutations.len(), query.len());
        let response = self.post(query).await?;
        map_outcomes(response, mutations.len())
    }

    fn max_items_per_call(&self) -> usize {
        self.max_items_per_call
    }

    async fn ping(&self) -> std::result::Result<(), PlatformError> {
        let response = self.post("query { me { id } }".to_string()).await?;
        match response.errors.first() {
            Some(e) => Err(PlatformError::Rejected {
                category: e.category(),
                message: e.message.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Map a decoded response to one outcome per alias.
fn map_outcomes(
    response: GraphqlResponse,
    count: usize,
) -> std::result::Result<Vec<ItemOutcome>, PlatformError> {
    let data = response.data.unwrap_or_default();

    // Request-level failure: nothing ran.
    if data.values().all(Json::is_null) {
        if let Some(e) = response.errors.iter().find(|e| e.alias().is_none()) {
            let category = e.category();
            return Err(match category {
                ErrorCategory::RateLimited => PlatformError::RateLimited { retry_after: None },
                c if c.is_transient() => PlatformError::Server {
                    status: 200,
                    message: e.message.clone(),
                },
                c => PlatformError::Rejected {
                    category: c,
                    message: e.message.clone(),
                },
            });
        }
    }

    let outcomes = (0..count)
        .map(|i| {
            let alias = format!("m{}", i);
            let id = data.get(&alias).and_then(|v| v.get("id")).and_then(|id| match id {
                Json::String(s) => Some(s.clone()),
                Json::Number(n) => Some(n.to_string()),
                _ => None,
            });
            if let Some(external_id) = id {
                return ItemOutcome::Created { external_id };
            }
            match response.errors.iter().find(|e| e.alias() == Some(alias.as_str())) {
                Some(e) if e.category().is_transient() => ItemOutcome::Retry {
                    message: e.message.clone(),
                },
                Some(e) => ItemOutcome::Rejected {
                    category: e.category(),
                    message: e.message.clone(),
                },
                None => ItemOutcome::Retry {
                    message: format!("no result for {}", alias),
                },
            }
        })
        .collect();
    Ok(outcomes)
}

fn transport_error(e: reqwest::Error) -> PlatformError {
    if e.is_timeout() {
        PlatformError::Timeout
    } else {
        PlatformError::Connection(e.to_string())
    }
}

/// Quote a GraphQL string literal.
fn graphql_string(s: &str) -> String {
    // JSON string escaping is valid GraphQL string escaping.
    Json::String(s.to_string()).to_string()
}

/// Column values travel as a JSON-encoded string argument.
fn graphql_json(value: &Json) -> String {
    graphql_string(&value.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
