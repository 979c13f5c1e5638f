//! Test doubles and common utilities for architecture contract tests
//!
//! `MockDirectory` is an in-memory subscriber directory that records every
//! call, counts mutations and fails on demand. Helpers build rule rows,
//! subscriber rows and a wired engine over a shared `MemoryTableStore`.

#![allow(dead_code)]

use segsync_core::config::{EngineConfig, ListStoreConfig, RuleSourceConfig};
use segsync_core::error::{Error, Result};
use segsync_core::traits::{
    FieldType, ListProfile, RemoteSubscriber, SegmentLabelRule, SubscriberDirectory,
    SubscriberPayload, TableStore, UpsertOutcome,
};
use segsync_core::{
    CellValue, ListId, ListRepository, MemoryTableStore, ReconcileEvent, ReconciliationEngine,
    Row, RuleSource,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// One recorded directory call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FindList(String),
    CreateList(String),
    ListFields,
    CreateField(String),
    ListSubscribers,
    Upsert(Vec<String>),
    Delete(String),
    ListLabels,
    CreateLabel(String),
}

/// Failures the mock should produce
#[derive(Debug, Default)]
pub struct Script {
    /// List names whose lookup fails
    pub fail_lookup: HashSet<String>,
    /// Field names whose creation fails
    pub fail_fields: HashSet<String>,
    /// Subscriber listing fails
    pub fail_list_subscribers: bool,
    /// Label listing fails
    pub fail_list_labels: bool,
    /// An upsert fails when it carries any of these emails
    pub fail_upsert_for: HashSet<String>,
    /// Like `fail_upsert_for`, but each email fails only its first upsert
    pub fail_upsert_once: HashSet<String>,
    /// Deleting these emails fails with a non-404 error
    pub fail_delete: HashSet<String>,
    /// Remaining failures per label name
    pub label_failures: HashMap<String, usize>,
    /// Raised after the first upsert completes
    pub shutdown_on_upsert: Option<watch::Sender<bool>>,
}

#[derive(Debug, Default)]
struct Remote {
    next_id: usize,
    lists: HashMap<String, ListId>,
    fields: HashMap<ListId, BTreeSet<String>>,
    subscribers: HashMap<ListId, BTreeMap<String, BTreeMap<String, String>>>,
    labels: HashMap<ListId, BTreeSet<String>>,
    label_rules: Vec<(String, SegmentLabelRule)>,
    created_profiles: Vec<ListProfile>,
}

/// A recording in-memory SubscriberDirectory
#[derive(Debug, Default)]
pub struct MockDirectory {
    remote: Mutex<Remote>,
    calls: Mutex<Vec<Call>>,
    pub script: Mutex<Script>,
    create_list_count: Arc<AtomicUsize>,
    create_field_count: Arc<AtomicUsize>,
    create_label_count: Arc<AtomicUsize>,
    list_labels_count: Arc<AtomicUsize>,
    list_fields_count: Arc<AtomicUsize>,
    upsert_count: Arc<AtomicUsize>,
    delete_count: Arc<AtomicUsize>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a remote list and return its id
    pub fn seed_list(&self, name: &str) -> ListId {
        let mut remote = self.remote.lock().unwrap();
        remote.next_id += 1;
        let id = ListId::new(remote.next_id);
        remote.lists.insert(name.to_string(), id.clone());
        id
    }

    pub fn seed_field(&self, list: &str, field: &str) {
        let mut remote = self.remote.lock().unwrap();
        let id = remote.lists[list].clone();
        remote.fields.entry(id).or_default().insert(field.to_string());
    }

    pub fn seed_label(&self, list: &str, label: &str) {
        let mut remote = self.remote.lock().unwrap();
        let id = remote.lists[list].clone();
        remote.labels.entry(id).or_default().insert(label.to_string());
    }

    pub fn seed_subscriber(&self, list: &str, email: &str, fields: &[(&str, &str)]) {
        let mut remote = self.remote.lock().unwrap();
        let id = remote.lists[list].clone();
        remote.subscribers.entry(id).or_default().insert(
            email.to_string(),
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    pub fn list_id(&self, list: &str) -> Option<ListId> {
        self.remote.lock().unwrap().lists.get(list).cloned()
    }

    /// Fields of a remote subscriber, if present
    pub fn subscriber(&self, list: &str, email: &str) -> Option<BTreeMap<String, String>> {
        let remote = self.remote.lock().unwrap();
        let id = remote.lists.get(list)?;
        remote.subscribers.get(id)?.get(email).cloned()
    }

    pub fn labels(&self, list: &str) -> BTreeSet<String> {
        let remote = self.remote.lock().unwrap();
        remote
            .lists
            .get(list)
            .and_then(|id| remote.labels.get(id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn label_rules(&self) -> Vec<(String, SegmentLabelRule)> {
        self.remote.lock().unwrap().label_rules.clone()
    }

    pub fn created_profiles(&self) -> Vec<ListProfile> {
        self.remote.lock().unwrap().created_profiles.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Only the delete and upsert calls, in order
    pub fn sync_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Upsert(_) | Call::Delete(_)))
            .collect()
    }

    pub fn create_list_count(&self) -> usize {
        self.create_list_count.load(Ordering::SeqCst)
    }

    pub fn create_field_count(&self) -> usize {
        self.create_field_count.load(Ordering::SeqCst)
    }

    pub fn create_label_count(&self) -> usize {
        self.create_label_count.load(Ordering::SeqCst)
    }

    pub fn list_labels_count(&self) -> usize {
        self.list_labels_count.load(Ordering::SeqCst)
    }

    pub fn list_fields_count(&self) -> usize {
        self.list_fields_count.load(Ordering::SeqCst)
    }

    pub fn upsert_count(&self) -> usize {
        self.upsert_count.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.delete_count.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl SubscriberDirectory for MockDirectory {
    async fn find_list_by_name(&self, name: &str) -> Result<Option<ListId>> {
        self.record(Call::FindList(name.to_string()));
        if self.script.lock().unwrap().fail_lookup.contains(name) {
            return Err(Error::http(format!("scripted lookup failure for {}", name)));
        }
        Ok(self.list_id(name))
    }

    async fn create_list(&self, profile: &ListProfile) -> Result<ListId> {
        self.record(Call::CreateList(profile.name.clone()));
        self.create_list_count.fetch_add(1, Ordering::SeqCst);
        let id = self.seed_list(&profile.name);
        self.remote
            .lock()
            .unwrap()
            .created_profiles
            .push(profile.clone());
        Ok(id)
    }

    async fn list_custom_fields(&self, list_id: &ListId) -> Result<BTreeSet<String>> {
        self.record(Call::ListFields);
        self.list_fields_count.fetch_add(1, Ordering::SeqCst);
        let remote = self.remote.lock().unwrap();
        Ok(remote.fields.get(list_id).cloned().unwrap_or_default())
    }

    async fn create_custom_field(
        &self,
        list_id: &ListId,
        name: &str,
        field_type: FieldType,
    ) -> Result<()> {
        self.record(Call::CreateField(name.to_string()));
        self.create_field_count.fetch_add(1, Ordering::SeqCst);
        assert_eq!(field_type, FieldType::Text, "fields are always created as text");
        if self.script.lock().unwrap().fail_fields.contains(name) {
            return Err(Error::http(format!("scripted field failure for {}", name)));
        }
        let mut remote = self.remote.lock().unwrap();
        remote
            .fields
            .entry(list_id.clone())
            .or_default()
            .insert(name.to_string());
        Ok(())
    }

    async fn list_subscribers(&self, list_id: &ListId) -> Result<Vec<RemoteSubscriber>> {
        self.record(Call::ListSubscribers);
        if self.script.lock().unwrap().fail_list_subscribers {
            return Err(Error::http("scripted subscriber listing failure"));
        }
        let remote = self.remote.lock().unwrap();
        Ok(remote
            .subscribers
            .get(list_id)
            .map(|subs| {
                subs.iter()
                    .map(|(email, fields)| RemoteSubscriber {
                        email: email.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_subscribers(
        &self,
        list_id: &ListId,
        records: &[SubscriberPayload],
        update_if_exists: bool,
    ) -> Result<UpsertOutcome> {
        self.record(Call::Upsert(records.iter().map(|r| r.email.clone()).collect()));
        self.upsert_count.fetch_add(1, Ordering::SeqCst);
        assert!(update_if_exists, "the engine always upserts with update-if-exists");

        {
            let mut script = self.script.lock().unwrap();
            if records.iter().any(|r| script.fail_upsert_for.contains(&r.email)) {
                return Err(Error::http("scripted upsert failure"));
            }
            let transient: Vec<String> = records
                .iter()
                .filter(|r| script.fail_upsert_once.contains(&r.email))
                .map(|r| r.email.clone())
                .collect();
            if !transient.is_empty() {
                for email in &transient {
                    script.fail_upsert_once.remove(email);
                }
                return Err(Error::http("scripted transient upsert failure"));
            }
        }

        {
            let mut remote = self.remote.lock().unwrap();
            let subs = remote.subscribers.entry(list_id.clone()).or_default();
            for record in records {
                subs.insert(record.email.clone(), record.fields.clone());
            }
        }
        if let Some(shutdown) = self.script.lock().unwrap().shutdown_on_upsert.take() {
            let _ = shutdown.send(true);
        }
        Ok(UpsertOutcome {
            success_count: records.len(),
            error_count: 0,
        })
    }

    async fn delete_subscriber(&self, list_id: &ListId, email: &str) -> Result<()> {
        self.record(Call::Delete(email.to_string()));
        self.delete_count.fetch_add(1, Ordering::SeqCst);
        if self.script.lock().unwrap().fail_delete.contains(email) {
            return Err(Error::http(format!("scripted delete failure for {}", email)));
        }
        let mut remote = self.remote.lock().unwrap();
        match remote
            .subscribers
            .get_mut(list_id)
            .and_then(|subs| subs.remove(email))
        {
            Some(_) => Ok(()),
            None => Err(Error::not_found(format!("subscriber {}", email))),
        }
    }

    async fn list_segment_labels(&self, list_id: &ListId) -> Result<BTreeSet<String>> {
        self.record(Call::ListLabels);
        self.list_labels_count.fetch_add(1, Ordering::SeqCst);
        if self.script.lock().unwrap().fail_list_labels {
            return Err(Error::http("scripted label listing failure"));
        }
        let remote = self.remote.lock().unwrap();
        Ok(remote.labels.get(list_id).cloned().unwrap_or_default())
    }

    async fn create_segment_label(
        &self,
        list_id: &ListId,
        name: &str,
        rule: &SegmentLabelRule,
    ) -> Result<()> {
        self.record(Call::CreateLabel(name.to_string()));
        self.create_label_count.fetch_add(1, Ordering::SeqCst);
        {
            let mut script = self.script.lock().unwrap();
            if let Some(remaining) = script.label_failures.get_mut(name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::unsupported(format!("scripted label failure for {}", name)));
                }
            }
        }
        let mut remote = self.remote.lock().unwrap();
        remote
            .labels
            .entry(list_id.clone())
            .or_default()
            .insert(name.to_string());
        remote.label_rules.push((name.to_string(), rule.clone()));
        Ok(())
    }

    fn directory_name(&self) -> &'static str {
        "mock"
    }
}

/// A rule row with the default column names
pub fn rule_row(list: &str, segment: &str, conditions: &[(&str, &str)]) -> Row {
    let mut row = Row::new()
        .with("ID Lista", CellValue::Empty)
        .with("NOMBRE LISTA", list)
        .with("NOMBRE SEGMENTO", segment);
    for (column, value) in conditions {
        row.set(*column, *value);
    }
    row
}

/// A subscriber row of a list's primary sheet
pub fn subscriber_row(email: &str, attributes: &[(&str, &str)], tags: &str) -> Row {
    let mut row = Row::new().with("email", email);
    for (column, value) in attributes {
        row.set(*column, *value);
    }
    let tags = if tags.is_empty() {
        CellValue::Empty
    } else {
        CellValue::Text(tags.to_string())
    };
    row.with("Segmentos", tags)
}

pub async fn seed_rules(store: &MemoryTableStore, rows: &[Row]) {
    let config = RuleSourceConfig::default();
    store
        .write_sheet(&config.store_id, &config.sheet, rows, false)
        .await
        .unwrap();
}

pub async fn seed_local_list(store: &MemoryTableStore, list: &str, rows: &[Row]) {
    store.write_sheet(list, "Datos", rows, false).await.unwrap();
}

/// Everything a contract test needs, wired over one memory store
pub struct Harness {
    pub store: MemoryTableStore,
    pub directory: Arc<MockDirectory>,
    pub rule_source: RuleSource,
    pub repository: ListRepository,
}

impl Harness {
    pub fn new() -> Self {
        let store = MemoryTableStore::new();
        let directory = Arc::new(MockDirectory::new());
        let rule_source = RuleSource::new(Arc::new(store.clone()), RuleSourceConfig::default());
        let repository = ListRepository::new(Arc::new(store.clone()), ListStoreConfig::default());
        Self {
            store,
            directory,
            rule_source,
            repository,
        }
    }

    pub fn engine(&self, config: EngineConfig) -> (ReconciliationEngine, mpsc::Receiver<ReconcileEvent>) {
        let directory: Arc<dyn SubscriberDirectory> = self.directory.clone();
        ReconciliationEngine::new(directory, self.repository.clone(), config)
            .expect("engine construction succeeds")
    }

    pub async fn run(&self) -> segsync_core::RunResult {
        self.run_with(EngineConfig::default()).await
    }

    pub async fn run_with(&self, config: EngineConfig) -> segsync_core::RunResult {
        let (engine, _events) = self.engine(config);
        engine
            .run_from_source(&self.rule_source)
            .await
            .expect("rules load")
    }
}

/// Drain every event currently buffered
pub fn drain(rx: &mut mpsc::Receiver<ReconcileEvent>) -> Vec<ReconcileEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
