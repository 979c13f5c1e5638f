//! Segment reconciliation engine
//!
//! The ReconciliationEngine is responsible for:
//! - Evaluating every segment rule against every subscriber of a list
//! - Detecting which subscribers' tags changed
//! - Pushing new and changed subscribers to the remote directory
//! - Persisting the snapshot and its change history
//! - Provisioning the segment labels that matched
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐
//! │  RuleSet    │─── ListRules ───┐
//! └─────────────┘                 │
//!                                 ▼
//!                      ┌─────────────────────┐
//!                      │ ReconciliationEngine│
//!                      └─────────────────────┘
//!                                 │
//!       ┌──────────────────┬──────┴───────────┬──────────────────┐
//!       ▼                  ▼                  ▼                  ▼
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐   ┌────────────┐
//! │ListRepo    │   │ Provisioner  │   │ Directory    │   │  Events    │
//! │(snapshot)  │   │(list/fields/ │   │(delete +     │   │ (notify)   │
//! │            │   │ labels)      │   │ upsert)      │   │            │
//! └────────────┘   └──────────────┘   └──────────────┘   └────────────┘
//! ```
//!
//! ## Per-list flow
//!
//! 1. Load the local snapshot
//! 2. Ensure the remote list exists
//! 3. Ensure the condition fields and the tag field exist
//! 4. Fetch remote emails once; upsert local emails the remote lacks
//! 5. Copy the snapshot as `before`
//! 6. Evaluate every rule against every subscriber, accumulating tags
//! 7. Diff `before` against the current snapshot
//! 8. Delete then re-upsert every changed subscriber, in batches
//! 9. Persist the snapshot and append the change set
//! 10. Ensure a segment label exists for every matched segment
//!
//! ## Failure scopes
//!
//! A batch failure skips the batch. A list failure (provisioning or local
//! persistence) skips the rest of that list. A label failure is recorded.
//! None of them stops the run.
//!
//! ## Shutdown
//!
//! A shutdown signal is honoured before each list and between batches,
//! never between a delete and its paired upsert. The interrupted list is
//! reported as failed without saving its snapshot, so the next run
//! recomputes and resends its changes. Lists not started are skipped.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::evaluator;
use crate::model::{ListId, SubscriberRecord};
use crate::provisioning::{LabelOutcome, Provisioner, RemoteListHandle};
use crate::rules::{ListRules, RuleSet, RuleSource};
use crate::snapshot::{ListRepository, missing_condition_columns};
use crate::tags;
use crate::traits::{SubscriberDirectory, SubscriberPayload};

/// Events emitted by the ReconciliationEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    /// Processing of a list started
    ListStarted {
        list_name: String,
        rules: usize,
    },

    /// A list was skipped (no rules)
    ListSkipped {
        list_name: String,
        reason: String,
    },

    /// A list failed and was abandoned
    ListFailed {
        list_name: String,
        error: String,
    },

    /// One delete/upsert batch failed
    BatchFailed {
        list_name: String,
        batch: usize,
        error: String,
    },

    /// A segment label was created remotely
    SegmentLabelCreated {
        list_name: String,
        label: String,
    },

    /// A segment label could not be created
    SegmentLabelFailed {
        list_name: String,
        label: String,
        error: String,
    },

    /// A list finished
    ListCompleted {
        list_name: String,
        changed: usize,
        upserted: usize,
    },

    /// The whole run finished
    RunCompleted {
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
}

/// Outcome of one processed list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListReport {
    /// List name
    pub list_name: String,
    /// Remote list id
    pub list_id: Option<ListId>,
    /// Whether the remote list was created in this run
    pub list_created: bool,
    /// Custom fields created in this run
    pub fields_created: Vec<String>,
    /// Condition attributes the local snapshot has no column for
    pub missing_columns: Vec<String>,
    /// Local subscribers
    pub subscribers: usize,
    /// Local subscribers absent remotely
    pub new_emails: usize,
    /// Subscribers whose tags changed
    pub changed: usize,
    /// Subscribers the directory accepted
    pub upserted: usize,
    /// Subscribers the directory rejected
    pub upsert_errors: usize,
    /// Delete/upsert batches attempted
    pub batches: usize,
    /// Batch-level error messages
    pub batch_errors: Vec<String>,
    /// Distinct segments matched by at least one subscriber, first-seen order
    pub segments_matched: Vec<String>,
    /// Segment labels created in this run
    pub segments_created: Vec<String>,
    /// Segment labels that failed, with error text
    pub segments_failed: Vec<(String, String)>,
}

/// A list that could not be reconciled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFailure {
    /// List name
    pub list_name: String,
    /// Error text
    pub error: String,
}

/// A segment label outcome, keyed by list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOutcome {
    /// List name
    pub list_name: String,
    /// Segment name
    pub segment_name: String,
    /// Error text (failures only)
    pub error: Option<String>,
}

/// Aggregate result of a reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    /// Lists reconciled, with detail
    pub lists_succeeded: Vec<ListReport>,
    /// Lists abandoned, with error text
    pub lists_failed: Vec<ListFailure>,
    /// Lists skipped, with the reason
    pub lists_skipped: Vec<(String, String)>,
    /// Segment labels created across lists
    pub segments_created: Vec<SegmentOutcome>,
    /// Segment labels that failed across lists
    pub segments_failed: Vec<SegmentOutcome>,
}

impl RunResult {
    /// Whether any list failed
    pub fn has_failures(&self) -> bool {
        !self.lists_failed.is_empty()
    }

    /// Report of one succeeded list
    pub fn report(&self, list_name: &str) -> Option<&ListReport> {
        self.lists_succeeded.iter().find(|r| r.list_name == list_name)
    }

    fn absorb(&mut self, report: ListReport) {
        for segment in &report.segments_created {
            self.segments_created.push(SegmentOutcome {
                list_name: report.list_name.clone(),
                segment_name: segment.clone(),
                error: None,
            });
        }
        for (segment, error) in &report.segments_failed {
            self.segments_failed.push(SegmentOutcome {
                list_name: report.list_name.clone(),
                segment_name: segment.clone(),
                error: Some(error.clone()),
            });
        }
        self.lists_succeeded.push(report);
    }
}

/// Core reconciliation engine
///
/// Lists are processed one after another; within a list every directory
/// call is awaited before the next one starts.
pub struct ReconciliationEngine {
    /// Remote subscriber directory
    directory: Arc<dyn SubscriberDirectory>,

    /// Local list snapshots
    repository: ListRepository,

    /// Remote list/field/label provisioning
    provisioner: Provisioner,

    /// Engine settings
    config: EngineConfig,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<ReconcileEvent>,
}

impl ReconciliationEngine {
    /// Create a new reconciliation engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields
    /// reconcile events
    pub fn new(
        directory: Arc<dyn SubscriberDirectory>,
        repository: ListRepository,
        config: EngineConfig,
    ) -> Result<(Self, mpsc::Receiver<ReconcileEvent>)> {
        config.validate()?;
        repository.config().validate()?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);
        let provisioner = Provisioner::new(
            Arc::clone(&directory),
            config.list_profile.clone(),
            repository.config().tag_field.clone(),
        );

        let engine = Self {
            directory,
            repository,
            provisioner,
            config,
            event_tx: tx,
        };

        Ok((engine, rx))
    }

    /// Create an engine whose events go nowhere
    fn without_events(
        directory: Arc<dyn SubscriberDirectory>,
        repository: ListRepository,
        config: EngineConfig,
    ) -> Result<Self> {
        let (engine, events) = Self::new(directory, repository, config)?;
        // A closed channel discards events silently
        drop(events);
        Ok(engine)
    }

    /// Load rules from `source` and reconcile every list
    ///
    /// # Errors
    ///
    /// Only when the rules cannot be loaded; list, batch and label
    /// failures are reported in the [`RunResult`].
    pub async fn run_from_source(&self, source: &RuleSource) -> Result<RunResult> {
        let rules = Self::load_rules(source).await?;
        Ok(self.run_internal(&rules, None).await)
    }

    /// Load rules from `source` and reconcile until `shutdown` turns `true`
    pub async fn run_from_source_with_shutdown(
        &self,
        source: &RuleSource,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunResult> {
        let rules = Self::load_rules(source).await?;
        Ok(self.run_internal(&rules, Some(&shutdown)).await)
    }

    /// Reconcile every selected list of `rules`
    pub async fn run(&self, rules: &RuleSet) -> RunResult {
        self.run_internal(rules, None).await
    }

    /// Reconcile every selected list of `rules` until `shutdown` turns `true`
    pub async fn run_with_shutdown(
        &self,
        rules: &RuleSet,
        shutdown: watch::Receiver<bool>,
    ) -> RunResult {
        self.run_internal(rules, Some(&shutdown)).await
    }

    async fn load_rules(source: &RuleSource) -> Result<RuleSet> {
        let rules = source.load_rules().await?;
        info!(
            "Loaded {} segment rules for {} lists",
            rules.rule_count(),
            rules.len()
        );
        Ok(rules)
    }

    async fn run_internal(
        &self,
        rules: &RuleSet,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> RunResult {
        let mut result = RunResult::default();

        for list_name in &self.config.only_lists {
            if rules.rules_for(list_name).is_empty() {
                self.skip_list(&mut result, list_name, "no segment rules");
            }
        }

        for list_rules in rules.lists() {
            if !self.config.includes_list(&list_rules.list_name) {
                debug!("List '{}' not selected, skipping", list_rules.list_name);
                continue;
            }
            if list_rules.rules.is_empty() {
                self.skip_list(&mut result, &list_rules.list_name, "no segment rules");
                continue;
            }
            if is_cancelled(shutdown) {
                self.skip_list(&mut result, &list_rules.list_name, "run cancelled");
                continue;
            }

            self.emit_event(ReconcileEvent::ListStarted {
                list_name: list_rules.list_name.clone(),
                rules: list_rules.rules.len(),
            });

            match self.reconcile_list(list_rules, shutdown).await {
                Ok(report) => {
                    info!(
                        "List '{}' done: {} changed, {} upserted, {} batch errors",
                        report.list_name,
                        report.changed,
                        report.upserted,
                        report.batch_errors.len()
                    );
                    self.emit_event(ReconcileEvent::ListCompleted {
                        list_name: report.list_name.clone(),
                        changed: report.changed,
                        upserted: report.upserted,
                    });
                    result.absorb(report);
                }
                Err(e) => {
                    error!("List '{}' failed: {}", list_rules.list_name, e);
                    self.emit_event(ReconcileEvent::ListFailed {
                        list_name: list_rules.list_name.clone(),
                        error: e.to_string(),
                    });
                    result.lists_failed.push(ListFailure {
                        list_name: list_rules.list_name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.emit_event(ReconcileEvent::RunCompleted {
            succeeded: result.lists_succeeded.len(),
            failed: result.lists_failed.len(),
            skipped: result.lists_skipped.len(),
        });
        result
    }

    /// Reconcile one list
    ///
    /// # Errors
    ///
    /// Any error returned here abandons the list: remote provisioning
    /// failures, local load/persist failures and shutdown.
    async fn reconcile_list(
        &self,
        list_rules: &ListRules,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<ListReport> {
        let list_name = list_rules.list_name.as_str();
        let mut report = ListReport {
            list_name: list_name.to_string(),
            ..ListReport::default()
        };

        let mut snapshot = self.repository.load_snapshot(list_name).await?;
        report.subscribers = snapshot.records.len();

        let missing = missing_condition_columns(&snapshot, &list_rules.rules);
        if !missing.is_empty() {
            warn!(
                "List '{}' has no local column for {:?}; those conditions match nobody",
                list_name, missing
            );
            report.missing_columns = missing.into_iter().collect();
        }

        let mut handle = self.provisioner.ensure_list_exists(list_name).await?;
        if let Some(previous) = &snapshot.meta.remote_list_id {
            if previous != handle.list_id() {
                warn!(
                    "List '{}' remote id changed from {} to {}",
                    list_name,
                    previous,
                    handle.list_id()
                );
            }
        }
        report.list_id = Some(handle.list_id().clone());
        report.list_created = handle.was_created();

        report.fields_created = self
            .provisioner
            .ensure_fields_exist(&mut handle, &list_rules.condition_attributes())
            .await?;

        // New local emails go up before evaluation
        let remote_emails = self.remote_emails(&handle).await;
        let new_records: Vec<&SubscriberRecord> = snapshot
            .records
            .iter()
            .filter(|r| !remote_emails.contains(&r.email))
            .collect();
        report.new_emails = new_records.len();
        if !new_records.is_empty() {
            info!(
                "List '{}': {} local subscribers missing remotely",
                list_name,
                new_records.len()
            );
            let payloads: Vec<SubscriberPayload> = new_records
                .iter()
                .map(|r| self.payload(r))
                .collect();
            self.upsert_in_batches(&handle, &payloads, &mut report, shutdown)
                .await?;
        }

        let before = snapshot.clone();

        let mut matched: Vec<String> = Vec::new();
        for rule in &list_rules.rules {
            let mut hits = 0usize;
            for record in snapshot.records.iter_mut() {
                if evaluator::rule_matches(&record.attributes, rule) {
                    hits += 1;
                    tags::apply(record, &rule.segment_name);
                }
            }
            debug!(
                "List '{}': segment '{}' matched {} subscribers",
                list_name, rule.segment_name, hits
            );
            if hits > 0 && !matched.contains(&rule.segment_name) {
                matched.push(rule.segment_name.clone());
            }
        }
        report.segments_matched = matched;

        let changes = snapshot.diff_segments(&before, Utc::now());
        report.changed = changes.len();
        if !changes.is_empty() {
            info!("List '{}': {} subscribers changed tags", list_name, changes.len());
            self.sync_changed(&handle, &changes.entries, &mut report, shutdown)
                .await?;
        }

        snapshot.meta.remote_list_id = Some(handle.list_id().clone());
        snapshot.meta.known_remote_fields = handle.known_fields();
        self.repository.save_snapshot(list_name, &snapshot).await?;
        self.repository.save_change_set(list_name, &changes).await?;

        for segment in report.segments_matched.clone() {
            match self
                .provisioner
                .ensure_segment_label_exists(&mut handle, &segment)
                .await
            {
                Ok(LabelOutcome::Created) => {
                    self.emit_event(ReconcileEvent::SegmentLabelCreated {
                        list_name: list_name.to_string(),
                        label: segment.clone(),
                    });
                    report.segments_created.push(segment);
                }
                Ok(LabelOutcome::AlreadyExists) => {}
                Err(e) => {
                    self.emit_event(ReconcileEvent::SegmentLabelFailed {
                        list_name: list_name.to_string(),
                        label: segment.clone(),
                        error: e.to_string(),
                    });
                    report.segments_failed.push((segment, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Remote emails of the list; a failed listing counts as none
    async fn remote_emails(&self, handle: &RemoteListHandle) -> BTreeSet<String> {
        match self.directory.list_subscribers(handle.list_id()).await {
            Ok(subscribers) => subscribers.into_iter().map(|s| s.email).collect(),
            Err(e) => {
                warn!(
                    "Could not list subscribers of '{}': {}. Treating every local subscriber as new.",
                    handle.list_name(),
                    e
                );
                BTreeSet::new()
            }
        }
    }

    /// Delete then re-upsert changed subscribers, batch by batch
    async fn sync_changed(
        &self,
        handle: &RemoteListHandle,
        changed: &[crate::model::ChangeEntry],
        report: &mut ListReport,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<()> {
        for chunk in changed.chunks(self.config.batch_size) {
            stop_if_cancelled(shutdown, handle, report)?;
            let batch = report.batches;
            report.batches += 1;
            let mut payloads = Vec::with_capacity(chunk.len());

            for entry in chunk {
                let email = entry.record.email.as_str();
                match self.directory.delete_subscriber(handle.list_id(), email).await {
                    Ok(()) => payloads.push(self.payload(&entry.record)),
                    Err(e) if e.is_not_found() => {
                        debug!("Subscriber {} was not on the remote list", email);
                        payloads.push(self.payload(&entry.record));
                    }
                    Err(e) => {
                        let err = Error::directory_batch(
                            batch,
                            format!("delete of {} failed, not re-uploaded: {}", email, e),
                        );
                        warn!("List '{}': {}", handle.list_name(), err);
                        self.record_batch_error(handle, batch, err, report);
                    }
                }
            }

            self.upsert_batch(handle, batch, &payloads, report).await;
        }
        Ok(())
    }

    /// Upsert payloads in configured batch sizes
    async fn upsert_in_batches(
        &self,
        handle: &RemoteListHandle,
        payloads: &[SubscriberPayload],
        report: &mut ListReport,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<()> {
        for chunk in payloads.chunks(self.config.batch_size) {
            stop_if_cancelled(shutdown, handle, report)?;
            let batch = report.batches;
            report.batches += 1;
            self.upsert_batch(handle, batch, chunk, report).await;
        }
        Ok(())
    }

    async fn upsert_batch(
        &self,
        handle: &RemoteListHandle,
        batch: usize,
        payloads: &[SubscriberPayload],
        report: &mut ListReport,
    ) {
        if payloads.is_empty() {
            return;
        }

        match self
            .directory
            .upsert_subscribers(handle.list_id(), payloads, true)
            .await
        {
            Ok(outcome) => {
                debug!(
                    "List '{}' batch {}: {} ok, {} rejected",
                    handle.list_name(),
                    batch,
                    outcome.success_count,
                    outcome.error_count
                );
                report.upserted += outcome.success_count;
                report.upsert_errors += outcome.error_count;
            }
            Err(e) => {
                let err = Error::directory_batch(batch, e.to_string());
                error!("List '{}': {}", handle.list_name(), err);
                self.record_batch_error(handle, batch, err, report);
            }
        }
    }

    fn record_batch_error(
        &self,
        handle: &RemoteListHandle,
        batch: usize,
        err: Error,
        report: &mut ListReport,
    ) {
        self.emit_event(ReconcileEvent::BatchFailed {
            list_name: handle.list_name().to_string(),
            batch,
            error: err.to_string(),
        });
        report.batch_errors.push(err.to_string());
    }

    /// Upsert payload: email, non-empty tags, every non-empty attribute
    fn payload(&self, record: &SubscriberRecord) -> SubscriberPayload {
        let mut fields: std::collections::BTreeMap<String, String> = record
            .attributes
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(column, value)| (column.clone(), value.as_text()))
            .collect();

        let tag_field = &self.repository.config().tag_field;
        let segments = record.segments.trim();
        if segments.is_empty() {
            fields.remove(tag_field);
        } else {
            fields.insert(tag_field.clone(), segments.to_string());
        }

        SubscriberPayload {
            email: record.email.trim().to_string(),
            fields,
        }
    }

    fn skip_list(&self, result: &mut RunResult, list_name: &str, reason: &str) {
        info!("Skipping list '{}': {}", list_name, reason);
        self.emit_event(ReconcileEvent::ListSkipped {
            list_name: list_name.to_string(),
            reason: reason.to_string(),
        });
        result
            .lists_skipped
            .push((list_name.to_string(), reason.to_string()));
    }

    /// Emit a reconcile event
    fn emit_event(&self, event: ReconcileEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
            }
            // Nobody is listening
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

fn is_cancelled(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.is_some_and(|rx| *rx.borrow())
}

fn stop_if_cancelled(
    shutdown: Option<&watch::Receiver<bool>>,
    handle: &RemoteListHandle,
    report: &ListReport,
) -> Result<()> {
    if is_cancelled(shutdown) {
        warn!(
            "List '{}': shutdown requested, stopping before batch {}",
            handle.list_name(),
            report.batches
        );
        return Err(Error::cancelled(format!(
            "stopped before batch {}; local state not saved",
            report.batches
        )));
    }
    Ok(())
}

/// Library entry point: load rules and reconcile every list
///
/// Events are discarded; build a [`ReconciliationEngine`] directly to
/// observe them.
///
/// # Errors
///
/// Only when the engine configuration is invalid or the rules cannot be
/// loaded ([`Error::MalformedRuleData`] among them).
pub async fn reconcile(
    rule_source: &RuleSource,
    repository: ListRepository,
    directory: Arc<dyn SubscriberDirectory>,
    config: EngineConfig,
) -> Result<RunResult> {
    let engine = ReconciliationEngine::without_events(directory, repository, config)?;
    engine.run_from_source(rule_source).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListStoreConfig;
    use crate::model::CellValue;
    use crate::store::MemoryTableStore;

    struct NoDirectory;

    #[async_trait::async_trait]
    impl SubscriberDirectory for NoDirectory {
        async fn find_list_by_name(&self, _name: &str) -> Result<Option<ListId>> {
            Err(Error::unsupported("offline"))
        }
        async fn create_list(&self, _profile: &crate::traits::ListProfile) -> Result<ListId> {
            Err(Error::unsupported("offline"))
        }
        async fn list_custom_fields(&self, _list_id: &ListId) -> Result<BTreeSet<String>> {
            Err(Error::unsupported("offline"))
        }
        async fn create_custom_field(
            &self,
            _list_id: &ListId,
            _name: &str,
            _field_type: crate::traits::FieldType,
        ) -> Result<()> {
            Err(Error::unsupported("offline"))
        }
        async fn list_subscribers(&self, _list_id: &ListId) -> Result<Vec<crate::traits::RemoteSubscriber>> {
            Err(Error::unsupported("offline"))
        }
        async fn upsert_subscribers(
            &self,
            _list_id: &ListId,
            _records: &[SubscriberPayload],
            _update_if_exists: bool,
        ) -> Result<crate::traits::UpsertOutcome> {
            Err(Error::unsupported("offline"))
        }
        async fn delete_subscriber(&self, _list_id: &ListId, _email: &str) -> Result<()> {
            Err(Error::unsupported("offline"))
        }
        async fn list_segment_labels(&self, _list_id: &ListId) -> Result<BTreeSet<String>> {
            Err(Error::unsupported("offline"))
        }
        async fn create_segment_label(
            &self,
            _list_id: &ListId,
            _name: &str,
            _rule: &crate::traits::SegmentLabelRule,
        ) -> Result<()> {
            Err(Error::unsupported("offline"))
        }
        fn directory_name(&self) -> &'static str {
            "offline"
        }
    }

    fn engine(config: EngineConfig) -> (ReconciliationEngine, mpsc::Receiver<ReconcileEvent>) {
        let repository = ListRepository::new(
            Arc::new(MemoryTableStore::new()),
            ListStoreConfig::default(),
        );
        ReconciliationEngine::new(Arc::new(NoDirectory), repository, config).unwrap()
    }

    #[test]
    fn test_engine_event_clone() {
        let event = ReconcileEvent::BatchFailed {
            list_name: "L1".to_string(),
            batch: 0,
            error: "timeout".to_string(),
        };
        assert_eq!(event.clone(), event);
    }

    #[test]
    fn test_payload_stringifies_and_drops_empty_cells() {
        let (engine, _rx) = engine(EngineConfig::default());
        let record = SubscriberRecord::new(" a@x.es ")
            .with_attribute("SEDE", "Madrid")
            .with_attribute("N ORGANO", 2.0)
            .with_attribute("ORGANO", CellValue::Empty)
            .with_segments("SegA;SegB");

        let payload = engine.payload(&record);
        assert_eq!(payload.email, "a@x.es");
        assert_eq!(payload.fields["SEDE"], "Madrid");
        assert_eq!(payload.fields["N ORGANO"], "2");
        assert_eq!(payload.fields["Segmentos"], "SegA;SegB");
        assert!(!payload.fields.contains_key("ORGANO"));
    }

    #[test]
    fn test_invalid_batch_size_is_rejected() {
        let repository = ListRepository::new(
            Arc::new(MemoryTableStore::new()),
            ListStoreConfig::default(),
        );
        let config = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        assert!(ReconciliationEngine::new(Arc::new(NoDirectory), repository, config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_directory_fails_list_not_run() {
        let (engine, mut rx) = engine(EngineConfig::default());
        let rules = crate::rules::group_rules(
            &[crate::model::Row::new()
                .with("NOMBRE LISTA", "L1")
                .with("NOMBRE SEGMENTO", "Seg1")
                .with("SEDE", "Madrid")],
            &crate::config::RuleSourceConfig::default(),
        )
        .unwrap();

        let result = engine.run(&rules).await;
        assert_eq!(result.lists_failed.len(), 1);
        assert!(result.lists_failed[0].error.contains("lookup failed"));

        assert!(matches!(rx.recv().await, Some(ReconcileEvent::ListStarted { .. })));
        assert!(matches!(rx.recv().await, Some(ReconcileEvent::ListFailed { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(ReconcileEvent::RunCompleted { failed: 1, .. })
        ));
    }

    #[test]
    fn test_library_entry_point_discards_events_silently() {
        let repository = ListRepository::new(
            Arc::new(MemoryTableStore::new()),
            ListStoreConfig::default(),
        );
        let config = EngineConfig {
            event_channel_capacity: 1,
            ..EngineConfig::default()
        };
        let engine =
            ReconciliationEngine::without_events(Arc::new(NoDirectory), repository, config).unwrap();
        assert!(engine.event_tx.is_closed());

        // Past capacity every send still lands in the closed arm
        for _ in 0..3 {
            engine.emit_event(ReconcileEvent::RunCompleted {
                succeeded: 0,
                failed: 0,
                skipped: 0,
            });
        }
        assert!(matches!(
            engine.event_tx.try_send(ReconcileEvent::RunCompleted {
                succeeded: 0,
                failed: 0,
                skipped: 0,
            }),
            Err(TrySendError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_before_run_skips_every_list() {
        let (engine, _rx) = engine(EngineConfig::default());
        let rules = crate::rules::group_rules(
            &[crate::model::Row::new()
                .with("NOMBRE LISTA", "L1")
                .with("NOMBRE SEGMENTO", "Seg1")
                .with("SEDE", "Madrid")],
            &crate::config::RuleSourceConfig::default(),
        )
        .unwrap();

        let (_tx, shutdown) = watch::channel(true);
        let result = engine.run_with_shutdown(&rules, shutdown).await;
        assert_eq!(result.lists_skipped, vec![("L1".to_string(), "run cancelled".to_string())]);
        // The offline directory was never reached
        assert!(result.lists_failed.is_empty());
    }

    #[tokio::test]
    async fn test_only_lists_without_rules_are_skipped() {
        let (engine, _rx) = engine(EngineConfig {
            only_lists: vec!["Ghost".to_string()],
            ..EngineConfig::default()
        });
        let result = engine.run(&RuleSet::default()).await;
        assert_eq!(result.lists_skipped, vec![("Ghost".to_string(), "no segment rules".to_string())]);
        assert!(!result.has_failures());
    }
}
