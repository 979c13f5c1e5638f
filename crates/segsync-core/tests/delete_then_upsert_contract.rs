//! Architectural Contract Test: Delete-then-Upsert Synchronization
//!
//! The directory does not clear fields on update, so a subscriber whose
//! tags changed is removed and re-added rather than updated in place.
//!
//! Constraints verified:
//! - New local subscribers are uploaded before rules are evaluated
//! - Every changed subscriber is deleted before its batch is upserted
//! - A subscriber already missing remotely is still uploaded
//! - A failed delete keeps that subscriber out of the upsert
//! - Changed subscribers are sent in batches of the configured size
//!
//! If this test fails, stale segment tags survive on the remote list.

mod common;

use common::*;
use segsync_core::EngineConfig;

async fn scenario_c(h: &Harness) {
    seed_rules(&h.store, &[rule_row("L1", "Seg1", &[("SEDE", "Madrid")])]).await;
    seed_local_list(
        &h.store,
        "L1",
        &[
            subscriber_row("a@x.es", &[("SEDE", "Madrid")], ""),
            subscriber_row("b@x.es", &[("SEDE", "Madrid")], ""),
            subscriber_row("c@x.es", &[("SEDE", "Bilbao")], ""),
        ],
    )
    .await;
    h.directory.seed_list("L1");
    h.directory.seed_subscriber("L1", "a@x.es", &[("SEDE", "Madrid")]);
}

#[tokio::test]
async fn new_emails_first_then_delete_before_upsert() {
    let h = Harness::new();
    scenario_c(&h).await;

    let result = h.run().await;
    assert!(!result.has_failures());

    assert_eq!(
        h.directory.sync_calls(),
        vec![
            Call::Upsert(vec!["b@x.es".into(), "c@x.es".into()]),
            Call::Delete("a@x.es".into()),
            Call::Delete("b@x.es".into()),
            Call::Upsert(vec!["a@x.es".into(), "b@x.es".into()]),
        ]
    );

    let report = result.report("L1").unwrap();
    assert_eq!(report.new_emails, 2);
    assert_eq!(report.changed, 2);
    assert_eq!(report.upserted, 4);
    assert!(report.batch_errors.is_empty());
    assert_eq!(report.segments_matched, vec!["Seg1".to_string()]);
    assert_eq!(report.segments_created, vec!["Seg1".to_string()]);

    let a = h.directory.subscriber("L1", "a@x.es").unwrap();
    assert_eq!(a["Segmentos"], "Seg1");
    assert_eq!(a["SEDE"], "Madrid");
    let c = h.directory.subscriber("L1", "c@x.es").unwrap();
    assert!(!c.contains_key("Segmentos"), "unmatched subscribers carry no tag field");
}

#[tokio::test]
async fn label_is_provisioned_after_sync() {
    let h = Harness::new();
    scenario_c(&h).await;

    h.run().await;

    let calls = h.directory.calls();
    let last_upsert = calls
        .iter()
        .rposition(|c| matches!(c, Call::Upsert(_)))
        .unwrap();
    let label = calls
        .iter()
        .position(|c| *c == Call::CreateLabel("Seg1".into()))
        .unwrap();
    assert!(label > last_upsert);
    assert!(h.directory.labels("L1").contains("Seg1"));
}

#[tokio::test]
async fn subscriber_missing_remotely_is_still_uploaded() {
    let h = Harness::new();
    scenario_c(&h).await;
    // b never reaches the remote list during the new-email upload
    h.directory
        .script
        .lock()
        .unwrap()
        .fail_upsert_once
        .insert("b@x.es".into());

    let result = h.run().await;
    assert!(!result.has_failures());

    let report = result.report("L1").unwrap();
    assert_eq!(report.batch_errors.len(), 1, "only the new-email batch failed");
    assert_eq!(report.changed, 2);

    let b = h.directory.subscriber("L1", "b@x.es").unwrap();
    assert_eq!(b["Segmentos"], "Seg1");
}

#[tokio::test]
async fn failed_delete_is_not_reuploaded() {
    let h = Harness::new();
    scenario_c(&h).await;
    h.directory
        .script
        .lock()
        .unwrap()
        .fail_delete
        .insert("a@x.es".into());

    let result = h.run().await;
    assert!(!result.has_failures(), "a delete failure stays within its batch");

    let calls = h.directory.sync_calls();
    assert_eq!(
        &calls[1..],
        &[
            Call::Delete("a@x.es".into()),
            Call::Delete("b@x.es".into()),
            Call::Upsert(vec!["b@x.es".into()]),
        ]
    );

    let report = result.report("L1").unwrap();
    assert_eq!(report.batch_errors.len(), 1);
    assert!(report.batch_errors[0].contains("a@x.es"));

    // The remote copy of a keeps its old fields
    let a = h.directory.subscriber("L1", "a@x.es").unwrap();
    assert!(!a.contains_key("Segmentos"));
}

#[tokio::test]
async fn changed_subscribers_are_batched() {
    let h = Harness::new();
    seed_rules(&h.store, &[rule_row("L1", "Seg1", &[("SEDE", "Madrid")])]).await;
    let emails = ["a@x.es", "b@x.es", "c@x.es", "d@x.es", "e@x.es"];
    let rows: Vec<_> = emails
        .iter()
        .map(|e| subscriber_row(e, &[("SEDE", "Madrid")], ""))
        .collect();
    seed_local_list(&h.store, "L1", &rows).await;
    h.directory.seed_list("L1");
    for email in emails {
        h.directory.seed_subscriber("L1", email, &[("SEDE", "Madrid")]);
    }

    let result = h
        .run_with(EngineConfig {
            batch_size: 2,
            ..EngineConfig::default()
        })
        .await;

    assert_eq!(
        h.directory.sync_calls(),
        vec![
            Call::Delete("a@x.es".into()),
            Call::Delete("b@x.es".into()),
            Call::Upsert(vec!["a@x.es".into(), "b@x.es".into()]),
            Call::Delete("c@x.es".into()),
            Call::Delete("d@x.es".into()),
            Call::Upsert(vec!["c@x.es".into(), "d@x.es".into()]),
            Call::Delete("e@x.es".into()),
            Call::Upsert(vec!["e@x.es".into()]),
        ]
    );

    let report = result.report("L1").unwrap();
    assert_eq!(report.batches, 3);
    assert_eq!(report.upserted, 5);
}

#[tokio::test]
async fn failed_upsert_batch_does_not_stop_later_batches() {
    let h = Harness::new();
    seed_rules(&h.store, &[rule_row("L1", "Seg1", &[("SEDE", "Madrid")])]).await;
    let emails = ["a@x.es", "b@x.es", "c@x.es"];
    let rows: Vec<_> = emails
        .iter()
        .map(|e| subscriber_row(e, &[("SEDE", "Madrid")], ""))
        .collect();
    seed_local_list(&h.store, "L1", &rows).await;
    h.directory.seed_list("L1");
    for email in emails {
        h.directory.seed_subscriber("L1", email, &[("SEDE", "Madrid")]);
    }
    h.directory
        .script
        .lock()
        .unwrap()
        .fail_upsert_for
        .insert("a@x.es".into());

    let result = h
        .run_with(EngineConfig {
            batch_size: 1,
            ..EngineConfig::default()
        })
        .await;

    let report = result.report("L1").unwrap();
    assert_eq!(report.batches, 3);
    assert_eq!(report.batch_errors.len(), 1);
    assert!(report.batch_errors[0].starts_with("Directory batch 0 failed"));
    assert_eq!(report.upserted, 2);
    assert!(h.directory.subscriber("L1", "c@x.es").is_some());
}
