//! Remote provisioning
//!
//! Makes sure the remote list, its custom fields and its segment labels
//! exist before subscribers are pushed. Every operation checks existence
//! first and only mutates what is missing, so running it twice is safe.
//!
//! Existence data is cached in a [`RemoteListHandle`] that lives for one
//! list of one run. Segment labels follow a small state machine:
//!
//! ```text
//! Unknown --(existence check)--> ConfirmedExists
//!                           \--> MustCreate --(create ok)----> ConfirmedExists
//!                                           \--(create error)-> Failed
//! ```
//!
//! Only `ConfirmedExists` suppresses later creation attempts.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::ListId;
use crate::traits::{FieldType, ListProfile, SegmentLabelRule, SubscriberDirectory};

/// Per-run state of one segment label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelState {
    /// Not checked yet
    Unknown,
    /// Present remotely
    ConfirmedExists,
    /// Checked and absent; creation pending
    MustCreate,
    /// Creation attempted and failed
    Failed,
}

/// What `ensure_segment_label_exists` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelOutcome {
    /// The label was already there
    AlreadyExists,
    /// The label was created by this call
    Created,
}

/// Existence cache for one remote list during one run
#[derive(Debug, Clone)]
pub struct RemoteListHandle {
    list_name: String,
    list_id: ListId,
    created: bool,
    existing_fields: Option<BTreeSet<String>>,
    existing_labels: Option<BTreeSet<String>>,
    label_states: HashMap<String, LabelState>,
}

impl RemoteListHandle {
    /// Create a handle for a list whose remote id is known
    pub fn new(list_name: impl Into<String>, list_id: ListId) -> Self {
        Self {
            list_name: list_name.into(),
            list_id,
            created: false,
            existing_fields: None,
            existing_labels: None,
            label_states: HashMap::new(),
        }
    }

    /// List name
    pub fn list_name(&self) -> &str {
        &self.list_name
    }

    /// Remote list id
    pub fn list_id(&self) -> &ListId {
        &self.list_id
    }

    /// Whether the list was created during this run
    pub fn was_created(&self) -> bool {
        self.created
    }

    /// Custom fields known to exist (empty until fetched)
    pub fn known_fields(&self) -> BTreeSet<String> {
        self.existing_fields.clone().unwrap_or_default()
    }

    /// Current state of a label
    pub fn label_state(&self, label: &str) -> LabelState {
        self.label_states
            .get(label)
            .copied()
            .unwrap_or(LabelState::Unknown)
    }
}

/// Idempotent, existence-checked remote provisioning
#[derive(Clone)]
pub struct Provisioner {
    directory: Arc<dyn SubscriberDirectory>,
    profile: ListProfile,
    tag_field: String,
}

impl Provisioner {
    /// Create a provisioner
    ///
    /// `profile` is used (renamed per list) when a list must be created.
    /// `tag_field` is always part of the required fields and is the field
    /// every segment label rule inspects.
    pub fn new(
        directory: Arc<dyn SubscriberDirectory>,
        profile: ListProfile,
        tag_field: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            profile,
            tag_field: tag_field.into(),
        }
    }

    /// Find the list by name, creating it from the default profile if absent
    ///
    /// # Errors
    ///
    /// [`Error::ListProvisioning`] when the lookup or the creation fails.
    pub async fn ensure_list_exists(&self, list_name: &str) -> Result<RemoteListHandle> {
        let found = self
            .directory
            .find_list_by_name(list_name)
            .await
            .map_err(|e| Error::list_provisioning(list_name, format!("lookup failed: {}", e)))?;

        if let Some(list_id) = found {
            debug!("List '{}' exists remotely with id {}", list_name, list_id);
            return Ok(RemoteListHandle::new(list_name, list_id));
        }

        info!("List '{}' not found remotely, creating it", list_name);
        let list_id = self
            .directory
            .create_list(&self.profile.named(list_name))
            .await
            .map_err(|e| Error::list_provisioning(list_name, format!("creation failed: {}", e)))?;

        info!("Created list '{}' with id {}", list_name, list_id);
        let mut handle = RemoteListHandle::new(list_name, list_id);
        handle.created = true;
        Ok(handle)
    }

    /// Create the custom fields the list is missing
    ///
    /// The tag field is always added to `required`. Existing fields are
    /// fetched once per handle; fields created here are added to the cache.
    ///
    /// # Returns
    ///
    /// Names of the fields created by this call.
    ///
    /// # Errors
    ///
    /// [`Error::ListProvisioning`] when the field listing or any creation
    /// fails.
    pub async fn ensure_fields_exist(
        &self,
        handle: &mut RemoteListHandle,
        required: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        if handle.existing_fields.is_none() {
            let fields = self
                .directory
                .list_custom_fields(&handle.list_id)
                .await
                .map_err(|e| {
                    Error::list_provisioning(&handle.list_name, format!("field listing failed: {}", e))
                })?;
            debug!("List '{}' has {} custom fields", handle.list_name, fields.len());
            handle.existing_fields = Some(fields);
        }

        let mut wanted = required.clone();
        wanted.insert(self.tag_field.clone());

        let missing: Vec<String> = {
            let existing = handle.existing_fields.get_or_insert_with(BTreeSet::new);
            wanted.difference(existing).cloned().collect()
        };

        let mut created = Vec::with_capacity(missing.len());
        for field in missing {
            info!("Creating field '{}' on list '{}'", field, handle.list_name);
            self.directory
                .create_custom_field(&handle.list_id, &field, FieldType::Text)
                .await
                .map_err(|e| {
                    Error::list_provisioning(
                        &handle.list_name,
                        format!("creating field '{}' failed: {}", field, e),
                    )
                })?;
            handle
                .existing_fields
                .get_or_insert_with(BTreeSet::new)
                .insert(field.clone());
            created.push(field);
        }

        if created.is_empty() {
            debug!("All required fields exist on list '{}'", handle.list_name);
        }
        Ok(created)
    }

    /// Create a segment label unless it is confirmed to exist
    ///
    /// Existing labels are fetched once per handle. A failed fetch is logged
    /// and treated as "no labels known", so creation is attempted.
    ///
    /// # Errors
    ///
    /// [`Error::SegmentLabelProvisioning`] when creation fails. The label is
    /// marked `Failed` and a later call tries again.
    pub async fn ensure_segment_label_exists(
        &self,
        handle: &mut RemoteListHandle,
        label: &str,
    ) -> Result<LabelOutcome> {
        if handle.label_state(label) == LabelState::ConfirmedExists {
            return Ok(LabelOutcome::AlreadyExists);
        }

        if handle.existing_labels.is_none() {
            let labels = match self.directory.list_segment_labels(&handle.list_id).await {
                Ok(labels) => labels,
                Err(e) => {
                    warn!(
                        "Could not list segment labels of '{}': {}. Assuming none exist.",
                        handle.list_name, e
                    );
                    BTreeSet::new()
                }
            };
            handle.existing_labels = Some(labels);
        }

        let exists = handle
            .existing_labels
            .as_ref()
            .is_some_and(|labels| labels.contains(label));
        if exists {
            handle
                .label_states
                .insert(label.to_string(), LabelState::ConfirmedExists);
            return Ok(LabelOutcome::AlreadyExists);
        }

        handle
            .label_states
            .insert(label.to_string(), LabelState::MustCreate);

        let rule = SegmentLabelRule::tag_contains(&self.tag_field, label);
        match self
            .directory
            .create_segment_label(&handle.list_id, label, &rule)
            .await
        {
            Ok(()) => {
                info!("Created segment label '{}' on list '{}'", label, handle.list_name);
                handle
                    .label_states
                    .insert(label.to_string(), LabelState::ConfirmedExists);
                if let Some(labels) = handle.existing_labels.as_mut() {
                    labels.insert(label.to_string());
                }
                Ok(LabelOutcome::Created)
            }
            Err(e) => {
                warn!(
                    "Failed to create segment label '{}' on list '{}': {}",
                    label, handle.list_name, e
                );
                handle.label_states.insert(label.to_string(), LabelState::Failed);
                Err(Error::label_provisioning(label, e.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("directory", &self.directory.directory_name())
            .field("tag_field", &self.tag_field)
            .finish_non_exhaustive()
    }
}
