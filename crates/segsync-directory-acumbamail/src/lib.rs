// # Acumbamail Subscriber Directory
//
// This crate provides an Acumbamail REST client implementing segsync's
// `SubscriberDirectory` trait.
//
// ## Implementation Status
//
// - ✅ One HTTP request per trait call (paging and 1000-subscriber chunking excepted)
// - ✅ Full error propagation to the engine (the engine decides scope)
// - ✅ HTTP timeout configured (30 seconds)
// - ✅ Specific error handling for HTTP status codes (401, 403, 404, 429, 5xx)
// - ✅ Dry-run mode for safe testing
// - ✅ Segment label creation delegated to an injected `SegmentLabelProvisioner`
// - ❌ NO retry logic (no automatic retries anywhere in segsync)
// - ❌ NO caching (existence caching is owned by the Provisioner)
// - ❌ NO background tasks
//
// ## Trust Level: Untrusted (Subscriber Directory)
//
// **Allowed Capabilities**:
// - ✅ Perform HTTP/HTTPS API calls to the configured endpoint only
// - ✅ Parse Acumbamail-specific responses
//
// **Forbidden Capabilities**:
// - ❌ Spawn tasks or threads
// - ❌ Implement retry logic
// - ❌ Access the local table store
//
// ## Security Requirements
//
// - API token NEVER appears in logs or `Debug` output
// - API token is provided via environment variables only
// - Construction fails fast if the token is empty
//
// ## API Reference
//
// Every endpoint lives under `https://acumbamail.com/api/1/`. GET requests
// carry `auth_token` as a query parameter, POST requests as a form field.
//
// - Lists: GET `getLists/`, POST `createList/`
// - Fields: GET `getMergeFields/`, POST `addMergeTag/`
// - Subscribers: GET `getSubscribers/` (paged by `block_index`),
//   POST `batchAddSubscribers/`, POST `deleteSubscriber/`
// - Segments: GET `getListSegments/`

use async_trait::async_trait;
use segsync_core::config::{DirectoryConfig, MAX_BATCH_SIZE};
use segsync_core::traits::{
    DirectoryFactory, FieldType, ListProfile, RemoteSubscriber, SegmentLabelProvisioner,
    SegmentLabelRule, SubscriberDirectory, SubscriberPayload, UpsertOutcome,
};
use segsync_core::{Error, ListId, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Acumbamail API base URL
pub const ACUMBAMAIL_API_BASE: &str = "https://acumbamail.com/api/1/";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Subscribers returned per `getSubscribers` block
const SUBSCRIBER_BLOCK_SIZE: usize = 1000;

/// List id handed out by `create_list` in dry-run mode
const DRY_RUN_LIST_ID: &str = "dry-run";

const PROVIDER: &str = "acumbamail";

/// Acumbamail subscriber directory
///
/// # Dry-Run Mode
///
/// When `dry_run` is true the client performs every read, logs each
/// mutation it would have sent and reports it as successful. Lists
/// "created" in dry-run mode get a placeholder id whose reads are empty.
pub struct AcumbamailDirectory {
    /// ⚠️ NEVER log this value
    api_token: String,

    /// Base URL ending in `/`
    base_url: String,

    client: reqwest::Client,

    /// Perform reads but skip mutations
    dry_run: bool,

    /// Creation path for segment labels (the API has none)
    label_provisioner: Option<Arc<dyn SegmentLabelProvisioner>>,
}

// Custom Debug implementation that hides the API token
impl std::fmt::Debug for AcumbamailDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcumbamailDirectory")
            .field("api_token", &"<REDACTED>")
            .field("base_url", &self.base_url)
            .field("dry_run", &self.dry_run)
            .field("label_provisioner", &self.label_provisioner.is_some())
            .finish()
    }
}

impl AcumbamailDirectory {
    /// Create a new Acumbamail client
    ///
    /// # Parameters
    ///
    /// - `api_token`: Acumbamail auth token
    /// - `base_url`: API base URL, defaults to [`ACUMBAMAIL_API_BASE`]
    /// - `dry_run`: If true, perform reads but skip mutations
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the token is empty, [`Error::Http`] when the
    /// HTTP client cannot be built.
    pub fn new(
        api_token: impl Into<String>,
        base_url: Option<String>,
        dry_run: bool,
    ) -> Result<Self> {
        let api_token = api_token.into();
        if api_token.trim().is_empty() {
            return Err(Error::config("Acumbamail API token cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("Failed to build HTTP client: {}", e)))?;

        let mut base_url = base_url.unwrap_or_else(|| ACUMBAMAIL_API_BASE.to_string());
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            api_token,
            base_url,
            client,
            dry_run,
            label_provisioner: None,
        })
    }

    /// Attach the provisioner used by `create_segment_label`
    pub fn with_label_provisioner(mut self, provisioner: Arc<dyn SegmentLabelProvisioner>) -> Self {
        self.label_provisioner = Some(provisioner);
        self
    }

    /// Whether mutations are suppressed
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}/", self.base_url, endpoint)
    }

    /// ```http
    /// GET /<endpoint>/?<params>&auth_token=<token>
    /// ```
    async fn get(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value> {
        tracing::debug!("GET {} {:?}", endpoint, params);

        let response = self
            .client
            .get(self.url(endpoint))
            .query(params)
            .query(&[("auth_token", self.api_token.as_str())])
            .send()
            .await
            .map_err(|e| request_error(endpoint, e))?;

        read_response(endpoint, response).await
    }

    /// ```http
    /// POST /<endpoint>/
    /// Content-Type: application/x-www-form-urlencoded
    ///
    /// <fields>&auth_token=<token>
    /// ```
    async fn post(&self, endpoint: &str, fields: Vec<(&str, String)>) -> Result<Value> {
        tracing::debug!(
            "POST {} ({})",
            endpoint,
            fields.iter().map(|(k, _)| *k).collect::<Vec<_>>().join(", ")
        );

        let mut form = fields;
        form.push(("auth_token", self.api_token.clone()));

        let response = self
            .client
            .post(self.url(endpoint))
            .form(&form)
            .send()
            .await
            .map_err(|e| request_error(endpoint, e))?;

        read_response(endpoint, response).await
    }

    fn is_placeholder(&self, list_id: &ListId) -> bool {
        self.dry_run && list_id.as_str() == DRY_RUN_LIST_ID
    }

    async fn add_subscriber_block(
        &self,
        list_id: &ListId,
        block: &[SubscriberPayload],
        update_if_exists: bool,
    ) -> Result<UpsertOutcome> {
        let subscribers: Vec<Value> = block.iter().map(subscriber_json).collect();

        if self.dry_run {
            tracing::info!(
                "[DRY-RUN] Would add {} subscribers to list {}",
                block.len(),
                list_id
            );
            return Ok(UpsertOutcome {
                success_count: block.len(),
                error_count: 0,
            });
        }

        let response = self
            .post(
                "batchAddSubscribers",
                vec![
                    ("list_id", list_id.to_string()),
                    ("subscribers_data", Value::Array(subscribers).to_string()),
                    ("update_subscriber", flag(update_if_exists)),
                    ("complete_json", "1".to_string()),
                ],
            )
            .await?;

        Ok(parse_batch_outcome(&response))
    }
}

#[async_trait]
impl SubscriberDirectory for AcumbamailDirectory {
    async fn find_list_by_name(&self, name: &str) -> Result<Option<ListId>> {
        let response = self.get("getLists", &[]).await?;
        let found = parse_lists(&response)
            .into_iter()
            .find(|(_, list_name)| list_name == name)
            .map(|(id, _)| id);

        match &found {
            Some(id) => tracing::debug!("Found list '{}' with id {}", name, id),
            None => tracing::debug!("List '{}' not found", name),
        }
        Ok(found)
    }

    async fn create_list(&self, profile: &ListProfile) -> Result<ListId> {
        if self.dry_run {
            tracing::info!("[DRY-RUN] Would create list '{}'", profile.name);
            return Ok(ListId::new(DRY_RUN_LIST_ID));
        }

        let response = self
            .post(
                "createList",
                vec![
                    ("sender_email", profile.sender_email.clone()),
                    ("name", profile.name.clone()),
                    ("company", profile.company.clone()),
                    ("country", profile.country.clone()),
                    ("city", profile.city.clone()),
                    ("address", profile.address.clone()),
                    ("phone", profile.phone.clone()),
                ],
            )
            .await?;

        parse_list_id(&response).ok_or_else(|| {
            Error::provider(
                PROVIDER,
                format!("Unexpected createList response: {}", response),
            )
        })
    }

    async fn list_custom_fields(&self, list_id: &ListId) -> Result<BTreeSet<String>> {
        if self.is_placeholder(list_id) {
            return Ok(BTreeSet::new());
        }
        let response = self
            .get("getMergeFields", &[("list_id", list_id.to_string())])
            .await?;
        Ok(parse_field_names(&response))
    }

    async fn create_custom_field(
        &self,
        list_id: &ListId,
        name: &str,
        field_type: FieldType,
    ) -> Result<()> {
        if self.dry_run {
            tracing::info!(
                "[DRY-RUN] Would add field '{}' ({}) to list {}",
                name,
                field_type.as_str(),
                list_id
            );
            return Ok(());
        }

        self.post(
            "addMergeTag",
            vec![
                ("list_id", list_id.to_string()),
                ("field_name", name.to_string()),
                ("field_type", field_type.as_str().to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_subscribers(&self, list_id: &ListId) -> Result<Vec<RemoteSubscriber>> {
        if self.is_placeholder(list_id) {
            return Ok(Vec::new());
        }

        let mut subscribers = Vec::new();
        let mut block_index = 0usize;
        loop {
            let response = self
                .get(
                    "getSubscribers",
                    &[
                        ("list_id", list_id.to_string()),
                        ("block_index", block_index.to_string()),
                        ("all_fields", "1".to_string()),
                        ("complete_json", "1".to_string()),
                    ],
                )
                .await;

            let block = match response {
                Ok(value) => parse_subscribers(&value),
                // Acumbamail answers an empty list (or block) with an error
                Err(e) if e.to_string().contains("No subscribers") => Vec::new(),
                Err(e) => return Err(e),
            };

            let received = block.len();
            subscribers.extend(block);
            if received < SUBSCRIBER_BLOCK_SIZE {
                break;
            }
            block_index += 1;
        }

        tracing::debug!("List {} has {} remote subscribers", list_id, subscribers.len());
        Ok(subscribers)
    }

    async fn upsert_subscribers(
        &self,
        list_id: &ListId,
        records: &[SubscriberPayload],
        update_if_exists: bool,
    ) -> Result<UpsertOutcome> {
        let mut total = UpsertOutcome::default();
        for block in records.chunks(MAX_BATCH_SIZE) {
            let outcome = self
                .add_subscriber_block(list_id, block, update_if_exists)
                .await?;
            total.success_count += outcome.success_count;
            total.error_count += outcome.error_count;
        }
        Ok(total)
    }

    async fn delete_subscriber(&self, list_id: &ListId, email: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!("[DRY-RUN] Would delete a subscriber from list {}", list_id);
            return Ok(());
        }

        match self
            .post(
                "deleteSubscriber",
                vec![("list_id", list_id.to_string()), ("email", email.to_string())],
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_missing_subscriber(&e) => {
                Err(Error::not_found(format!("subscriber not on list {}", list_id)))
            }
            Err(e) => Err(e),
        }
    }

    async fn list_segment_labels(&self, list_id: &ListId) -> Result<BTreeSet<String>> {
        if self.is_placeholder(list_id) {
            return Ok(BTreeSet::new());
        }
        let response = self
            .get("getListSegments", &[("list_id", list_id.to_string())])
            .await?;
        Ok(parse_segment_names(&response))
    }

    async fn create_segment_label(
        &self,
        list_id: &ListId,
        name: &str,
        rule: &SegmentLabelRule,
    ) -> Result<()> {
        if self.dry_run {
            tracing::info!(
                "[DRY-RUN] Would create segment '{}' on list {} ({} {:?} '{}')",
                name,
                list_id,
                rule.field,
                rule.operator,
                rule.value
            );
            return Ok(());
        }

        match &self.label_provisioner {
            Some(provisioner) => provisioner.create_label(list_id, name, rule).await,
            None => Err(Error::unsupported(
                "Acumbamail has no segment creation endpoint and no label provisioner is configured",
            )),
        }
    }

    fn directory_name(&self) -> &'static str {
        PROVIDER
    }
}

fn request_error(endpoint: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::http(format!("{} timed out", endpoint))
    } else {
        // Without the URL: it carries the token on GET requests
        Error::http(format!("{} request failed: {}", endpoint, err.without_url()))
    }
}

async fn read_response(endpoint: &str, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read response body".to_string());

    if !status.is_success() {
        return Err(status_error(endpoint, status.as_u16(), &body));
    }
    Ok(parse_body(&body))
}

/// Map an HTTP error status to an error variant
fn status_error(endpoint: &str, status: u16, body: &str) -> Error {
    let body = body.trim();
    match status {
        401 | 403 => Error::auth(format!(
            "{}: invalid API token or insufficient permissions (status {})",
            endpoint, status
        )),
        404 => Error::not_found(format!("{}: {}", endpoint, body)),
        429 => Error::rate_limited(format!("{}: status {}", endpoint, status)),
        500..=599 => Error::directory(format!(
            "Acumbamail server error (transient) on {}: {} - {}",
            endpoint, status, body
        )),
        _ => Error::provider(PROVIDER, format!("{} failed: {} - {}", endpoint, status, body)),
    }
}

/// JSON when it parses, the trimmed text otherwise
fn parse_body(body: &str) -> Value {
    let body = body.trim();
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

fn is_missing_subscriber(err: &Error) -> bool {
    if err.is_not_found() {
        return true;
    }
    let text = err.to_string().to_lowercase();
    text.contains("not found") || text.contains("does not exist") || text.contains("no existe")
}

fn flag(value: bool) -> String {
    String::from(if value { "1" } else { "0" })
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn subscriber_json(payload: &SubscriberPayload) -> Value {
    let mut object = serde_json::Map::new();
    object.insert("email".to_string(), Value::String(payload.email.clone()));
    for (field, value) in &payload.fields {
        object.insert(field.clone(), Value::String(value.clone()));
    }
    Value::Object(object)
}

/// `getLists` answers `{id: name}` or `{id: {name, ...}}`
fn parse_lists(value: &Value) -> Vec<(ListId, String)> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter_map(|(id, data)| {
                let name = match data {
                    Value::Object(inner) => inner.get("name").and_then(scalar_text),
                    other => scalar_text(other),
                }?;
                Some((ListId::new(id), name))
            })
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let id = item.get("id").and_then(scalar_text)?;
                let name = item.get("name").and_then(scalar_text)?;
                Some((ListId::new(id), name))
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// `createList` answers a bare id, a numeric string, `{id}` or `{list_id}`
fn parse_list_id(value: &Value) -> Option<ListId> {
    match value {
        Value::Number(n) => Some(ListId::new(n)),
        Value::String(s) if !s.trim().is_empty() && s.trim().chars().all(|c| c.is_ascii_digit()) => {
            Some(ListId::new(s.trim()))
        }
        Value::Object(map) => map
            .get("id")
            .or_else(|| map.get("list_id"))
            .and_then(parse_list_id),
        _ => None,
    }
}

/// `getMergeFields` answers `{name: {...}}` or `[{name, ...}]`
fn parse_field_names(value: &Value) -> BTreeSet<String> {
    match value {
        Value::Object(map) => map.keys().cloned().collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(field) => field.get("name").and_then(scalar_text),
                Value::String(name) => Some(name.clone()),
                _ => None,
            })
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// `getSubscribers` answers a list of objects, `{subscribers: [...]}` or
/// an object keyed by subscriber id
fn parse_subscribers(value: &Value) -> Vec<RemoteSubscriber> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => match map.get("subscribers") {
            Some(Value::Array(items)) => items.iter().collect(),
            _ => map.values().filter(|v| v.is_object()).collect(),
        },
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| {
            let object = item.as_object()?;
            let email = object.get("email").and_then(scalar_text)?;
            let fields: BTreeMap<String, String> = object
                .iter()
                .filter(|(key, _)| key.as_str() != "email")
                .filter_map(|(key, value)| scalar_text(value).map(|v| (key.clone(), v)))
                .collect();
            Some(RemoteSubscriber {
                email: email.trim().to_string(),
                fields,
            })
        })
        .collect()
}

/// `getListSegments` answers names, `[name, ...]` tuples or `{name, ...}` objects
fn parse_segment_names(value: &Value) -> BTreeSet<String> {
    fn segment_name(item: &Value) -> Option<String> {
        match item {
            Value::String(name) => Some(name.clone()),
            Value::Array(tuple) => tuple.first().and_then(scalar_text),
            Value::Object(segment) => segment.get("name").and_then(scalar_text),
            _ => None,
        }
    }

    match value {
        Value::Array(items) => items.iter().filter_map(segment_name).collect(),
        Value::Object(map) => match map.get("segments") {
            Some(inner) => parse_segment_names(inner),
            None => segment_name(value).into_iter().collect(),
        },
        _ => BTreeSet::new(),
    }
}

/// With `complete_json=1` each accepted subscriber comes back with an `id`;
/// without it as `{email: id}`
fn parse_batch_outcome(value: &Value) -> UpsertOutcome {
    fn accepted(item: &Value) -> bool {
        match item.as_object() {
            Some(object) if object.contains_key("id") => true,
            Some(object) if object.len() == 1 => object
                .iter()
                .all(|(key, value)| key.contains('@') && value.is_number()),
            _ => false,
        }
    }

    match value {
        Value::Array(items) => {
            let success_count = items.iter().filter(|item| accepted(item)).count();
            UpsertOutcome {
                success_count,
                error_count: items.len() - success_count,
            }
        }
        Value::Object(_) if accepted(value) => UpsertOutcome {
            success_count: 1,
            error_count: 0,
        },
        Value::Object(_) => UpsertOutcome {
            success_count: 0,
            error_count: 1,
        },
        _ => UpsertOutcome::default(),
    }
}

/// Factory for creating Acumbamail directory clients
///
/// The factory cannot inject a label provisioner; build
/// [`AcumbamailDirectory`] directly to attach one.
pub struct AcumbamailFactory;

impl DirectoryFactory for AcumbamailFactory {
    fn create(&self, config: &DirectoryConfig) -> Result<Box<dyn SubscriberDirectory>> {
        match config {
            DirectoryConfig::Acumbamail {
                api_token,
                base_url,
            } => {
                if api_token.is_empty() {
                    return Err(Error::config("Acumbamail API token is required"));
                }

                let dry_run = std::env::var("SEGSYNC_MODE")
                    .unwrap_or_default()
                    .to_lowercase()
                    == "dry-run";

                if dry_run {
                    tracing::warn!(
                        "Acumbamail directory running in DRY-RUN mode - no changes will be made"
                    );
                }

                Ok(Box::new(AcumbamailDirectory::new(
                    api_token.clone(),
                    base_url.clone(),
                    dry_run,
                )?))
            }
            _ => Err(Error::config("Invalid config for Acumbamail directory")),
        }
    }
}

/// Register the Acumbamail directory with a registry
///
/// # Example
///
/// ```rust
/// use segsync_core::ComponentRegistry;
///
/// let registry = ComponentRegistry::with_builtin_stores();
/// segsync_directory_acumbamail::register(&registry);
/// assert!(registry.has_directory("acumbamail"));
/// ```
pub fn register(registry: &segsync_core::ComponentRegistry) {
    registry.register_directory("acumbamail", Box::new(AcumbamailFactory));
}
