// # Subscriber Directory Trait
//
// Defines the interface for the remote email-marketing directory that
// owns lists, custom fields, subscribers and segment labels.
//
// ## Implementations
//
// - Acumbamail-style REST API: `segsync-directory-acumbamail` crate
//
// ## Usage
//
// ```rust,ignore
// use segsync_core::SubscriberDirectory;
//
// let list_id = match directory.find_list_by_name("Lista Madrid").await? {
//     Some(id) => id,
//     None => directory.create_list(&profile).await?,
// };
// let fields = directory.list_custom_fields(&list_id).await?;
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::model::ListId;

/// Profile used when a list must be created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListProfile {
    /// List name
    pub name: String,
    /// Sender email address
    pub sender_email: String,
    /// Company name
    pub company: String,
    /// Country
    pub country: String,
    /// City
    pub city: String,
    /// Postal address
    pub address: String,
    /// Phone number
    pub phone: String,
}

impl ListProfile {
    /// Copy this profile under another list name
    pub fn named(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

/// Custom field type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Free text
    Text,
    /// Numeric
    Number,
    /// Date
    Date,
}

impl FieldType {
    /// Wire name of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Date => "date",
        }
    }
}

/// A subscriber as the directory reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSubscriber {
    /// Subscriber email
    pub email: String,
    /// Field values as strings
    pub fields: BTreeMap<String, String>,
}

/// A subscriber to upsert: email plus stringified fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberPayload {
    /// Subscriber email
    pub email: String,
    /// Field values (tag field included)
    pub fields: BTreeMap<String, String>,
}

/// Outcome of a batch upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    /// Subscribers accepted
    pub success_count: usize,
    /// Subscribers rejected
    pub error_count: usize,
}

/// Comparison used by a segment label's membership rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOperator {
    /// Field contains the value
    Contains,
    /// Field equals the value
    Equals,
}

/// Membership rule attached to a remote segment label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLabelRule {
    /// Field the rule inspects (the tag field)
    pub field: String,
    /// Comparison
    pub operator: LabelOperator,
    /// Value compared against
    pub value: String,
}

impl SegmentLabelRule {
    /// "`field` contains `segment`", the rule every reconciled label uses
    pub fn tag_contains(field: impl Into<String>, segment: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: LabelOperator::Contains,
            value: segment.into(),
        }
    }
}

/// Trait for subscriber directory implementations
///
/// # Trust Level: Untrusted
///
/// Directory clients are external integrations:
/// - ✅ Perform API calls to their own endpoints
/// - ✅ Return success or failure per call
/// - ❌ Retry, back off or cache between calls (the engine decides what to call)
/// - ❌ Spawn tasks or threads
///
/// Every method is a single logical request; timeouts surface as errors.
#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    /// Find a list id by exact list name
    ///
    /// # Returns
    ///
    /// - `Ok(Some(ListId))`: The list exists
    /// - `Ok(None)`: No list with that name
    /// - `Err(Error)`: The lookup failed
    async fn find_list_by_name(&self, name: &str) -> Result<Option<ListId>, crate::Error>;

    /// Create a list from a profile and return its id
    async fn create_list(&self, profile: &ListProfile) -> Result<ListId, crate::Error>;

    /// Names of the custom fields defined on a list
    async fn list_custom_fields(&self, list_id: &ListId) -> Result<BTreeSet<String>, crate::Error>;

    /// Create one custom field
    async fn create_custom_field(
        &self,
        list_id: &ListId,
        name: &str,
        field_type: FieldType,
    ) -> Result<(), crate::Error>;

    /// Every subscriber of a list
    async fn list_subscribers(&self, list_id: &ListId) -> Result<Vec<RemoteSubscriber>, crate::Error>;

    /// Add subscribers, optionally updating the ones that already exist
    async fn upsert_subscribers(
        &self,
        list_id: &ListId,
        records: &[SubscriberPayload],
        update_if_exists: bool,
    ) -> Result<UpsertOutcome, crate::Error>;

    /// Remove one subscriber from a list
    ///
    /// Returns [`crate::Error::NotFound`] when the subscriber is absent.
    async fn delete_subscriber(&self, list_id: &ListId, email: &str) -> Result<(), crate::Error>;

    /// Names of the segment labels defined on a list
    async fn list_segment_labels(&self, list_id: &ListId) -> Result<BTreeSet<String>, crate::Error>;

    /// Create a segment label (potentially slow, e.g. UI-automated)
    async fn create_segment_label(
        &self,
        list_id: &ListId,
        name: &str,
        rule: &SegmentLabelRule,
    ) -> Result<(), crate::Error>;

    /// Client name for logging
    fn directory_name(&self) -> &'static str;
}

/// Heavy-weight creation path for segment labels
///
/// Some directories expose no API for creating segments; creation is then
/// delegated to an external automation (for example a browser driver)
/// implementing this trait.
#[async_trait]
pub trait SegmentLabelProvisioner: Send + Sync {
    /// Create `name` on `list_id` with `rule`
    async fn create_label(
        &self,
        list_id: &ListId,
        name: &str,
        rule: &SegmentLabelRule,
    ) -> Result<(), crate::Error>;
}

/// Helper trait for constructing directory clients from configuration
pub trait DirectoryFactory: Send + Sync {
    /// Create a SubscriberDirectory instance from configuration
    fn create(
        &self,
        config: &crate::config::DirectoryConfig,
    ) -> Result<Box<dyn SubscriberDirectory>, crate::Error>;
}
