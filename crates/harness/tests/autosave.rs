use std::time::Duration;

use loanrec_core::{FieldPath, FieldUpdates, FieldValue, HistoryAction};
use loanrec_engine::{EngineConfig, ErrorKind, FlushOutcome, SaveStatus};
use loanrec_harness::{Failure, TestDesk};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const ADDRESS: &str = "propertyInfo.propertyAddress";
const PROPERTY_TYPE: &str = "propertyInfo.propertyType";

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// ============================================================================
// Debounce
// ============================================================================

#[tokio::test(start_paused = true)]
async fn rapid_edits_coalesce_into_one_patch() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;

    for n in 1..=5 {
        desk.engine
            .update_field(&desk.borrower, id, ADDRESS, format!("{n} Main St"))
            .await?;
        advance(100).await;
    }
    assert_eq!(desk.store.patch_count(), 0);

    advance(2_000).await;
    assert_eq!(desk.store.patch_count(), 1);
    let batch = desk.store.last_patch().ok_or("no patch recorded")?;
    assert_eq!(batch.len(), 1);
    assert_eq!(
        batch.get(&FieldPath::parse(ADDRESS)?),
        Some(&FieldValue::from("5 Main St"))
    );
    assert!(!desk.engine.has_unsaved_changes(id));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn each_edit_restarts_the_window() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;

    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.firstName", "Ann")
        .await?;
    advance(1_500).await;
    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.lastName", "Lee")
        .await?;
    advance(1_500).await;
    assert_eq!(desk.store.patch_count(), 0);

    advance(600).await;
    assert_eq!(desk.store.patch_count(), 1);
    assert_eq!(desk.store.last_patch().map(|b| b.len()), Some(2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn configured_delay_is_honoured() -> TestResult {
    let config = EngineConfig::from_toml_str("[autosave]\ndelay_ms = 250")?;
    let desk = TestDesk::with_config(config)?;
    let id = desk.create_dscr().await?;

    desk.engine
        .update_field(&desk.borrower, id, ADDRESS, "1 Elm")
        .await?;
    advance(200).await;
    assert_eq!(desk.store.patch_count(), 0);
    advance(100).await;
    assert_eq!(desk.store.patch_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn edits_to_different_records_flush_independently() -> TestResult {
    let desk = TestDesk::new()?;
    let first = desk.create_dscr().await?;
    let second = desk.create_dscr().await?;

    desk.engine
        .update_field(&desk.borrower, first, ADDRESS, "1 Elm")
        .await?;
    advance(1_000).await;
    desk.engine
        .update_field(&desk.borrower, second, ADDRESS, "2 Elm")
        .await?;
    advance(1_100).await;

    let patched: Vec<_> = desk.store.patches().into_iter().map(|(id, _)| id).collect();
    assert_eq!(patched, vec![first]);
    advance(1_000).await;
    let patched: Vec<_> = desk.store.patches().into_iter().map(|(id, _)| id).collect();
    assert_eq!(patched, vec![first, second]);
    Ok(())
}

// ============================================================================
// Flush semantics
// ============================================================================

#[tokio::test(start_paused = true)]
async fn save_status_follows_the_batch() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;
    assert_eq!(desk.engine.save_status(id), SaveStatus::Idle);

    desk.engine
        .update_field(&desk.borrower, id, ADDRESS, "1 Elm")
        .await?;
    assert_eq!(desk.engine.save_status(id), SaveStatus::Pending);

    let outcome = desk.engine.flush(&desk.borrower, id).await?;
    assert_eq!(outcome, FlushOutcome::Persisted { paths: 1 });
    assert_eq!(desk.engine.save_status(id), SaveStatus::Saved);

    assert_eq!(desk.engine.flush(&desk.borrower, id).await?, FlushOutcome::Clean);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unchanged_batch_writes_nothing() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;

    desk.engine
        .update_field(&desk.borrower, id, ADDRESS, "1 Elm")
        .await?;
    desk.engine.flush(&desk.borrower, id).await?;
    let history_len = desk.stored(id).ok_or("missing record")?.history.len();

    desk.engine
        .update_field(&desk.borrower, id, ADDRESS, "1 Elm")
        .await?;
    let outcome = desk.engine.flush(&desk.borrower, id).await?;

    assert_eq!(outcome, FlushOutcome::Unchanged);
    assert_eq!(desk.store.patch_count(), 1);
    assert_eq!(
        desk.stored(id).ok_or("missing record")?.history.len(),
        history_len
    );
    assert!(!desk.engine.has_unsaved_changes(id));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn edits_during_a_flush_form_the_next_batch() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;
    desk.store.set_patch_latency(Some(Duration::from_millis(500)));

    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.firstName", "Ann")
        .await?;
    advance(2_100).await;
    // Timer fired at 2000ms; the patch is still in flight.
    assert_eq!(desk.store.patch_count(), 1);
    assert_eq!(desk.engine.save_status(id), SaveStatus::Saving);

    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.lastName", "Lee")
        .await?;
    assert!(desk.engine.has_unsaved_changes(id));

    advance(3_000).await;
    let patches = desk.store.patches();
    assert_eq!(patches.len(), 2);
    let first: Vec<_> = patches[0].1.paths().map(|p| p.as_str().to_string()).collect();
    let second: Vec<_> = patches[1].1.paths().map(|p| p.as_str().to_string()).collect();
    assert_eq!(first, vec!["borrowerInfo.firstName"]);
    assert_eq!(second, vec!["borrowerInfo.lastName"]);

    let stored = desk.stored(id).ok_or("missing record")?;
    assert_eq!(
        stored.read(&FieldPath::parse("borrowerInfo.firstName")?),
        Some(&FieldValue::from("Ann"))
    );
    assert_eq!(
        stored.read(&FieldPath::parse("borrowerInfo.lastName")?),
        Some(&FieldValue::from("Lee"))
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn flush_now_bypasses_the_timer() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;

    let updates = FieldUpdates::parse([("loanDetails.loanPurpose", FieldValue::from("purchase"))])?;
    let outcome = desk
        .engine
        .scheduler()
        .flush_now(id, updates, &desk.broker.user_id)
        .await?;

    assert_eq!(outcome, FlushOutcome::Persisted { paths: 1 });
    assert_eq!(desk.store.patch_count(), 1);
    Ok(())
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failed_batch_is_kept_for_manual_retry() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;
    desk.store.fail_next_patch(Failure::Unavailable);

    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.firstName", "Ann")
        .await?;
    advance(2_100).await;
    assert_eq!(desk.store.patch_count(), 1);
    assert_eq!(desk.engine.save_status(id), SaveStatus::Failed);
    assert!(desk.engine.has_unsaved_changes(id));
    assert!(desk.engine.last_save_error(id).is_some());

    // No automatic retry.
    advance(10_000).await;
    assert_eq!(desk.store.patch_count(), 1);

    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.lastName", "Lee")
        .await?;
    let outcome = desk.engine.flush(&desk.borrower, id).await?;
    assert_eq!(outcome, FlushOutcome::Persisted { paths: 2 });
    assert_eq!(desk.engine.save_status(id), SaveStatus::Saved);
    assert_eq!(desk.engine.last_save_error(id), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn explicit_flush_surfaces_store_unavailable() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;
    desk.store.fail_next_patch(Failure::Unavailable);

    desk.engine
        .update_field(&desk.borrower, id, ADDRESS, "1 Elm")
        .await?;
    let err = desk.engine.flush(&desk.borrower, id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);

    // Newer edit for the same path wins over the restored batch.
    desk.engine
        .update_field(&desk.borrower, id, ADDRESS, "2 Elm")
        .await?;
    desk.engine.flush(&desk.borrower, id).await?;
    let batch = desk.store.last_patch().ok_or("no patch recorded")?;
    assert_eq!(
        batch.get(&FieldPath::parse(ADDRESS)?),
        Some(&FieldValue::from("2 Elm"))
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn permission_failure_stops_autosave_for_the_record() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;
    desk.store.fail_patches(Some(Failure::PermissionDenied));

    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.firstName", "Ann")
        .await?;
    advance(2_100).await;
    assert_eq!(desk.store.patch_count(), 1);
    assert!(desk.engine.scheduler().is_blocked(id));
    assert_eq!(desk.engine.save_status(id), SaveStatus::Failed);

    // Later edits still land in memory but never reach the store.
    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.lastName", "Lee")
        .await?;
    let working = desk.engine.get_application(&desk.borrower, id).await?;
    assert_eq!(
        working.read(&FieldPath::parse("borrowerInfo.lastName")?),
        Some(&FieldValue::from("Lee"))
    );
    advance(10_000).await;
    assert_eq!(desk.store.patch_count(), 1);

    // An explicit flush retries; the store still refuses.
    let err = desk.engine.flush(&desk.borrower, id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(desk.store.patch_count(), 2);
    assert!(desk.engine.scheduler().is_blocked(id));
    assert!(desk.engine.has_unsaved_changes(id));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn explicit_flush_lifts_the_block_once_the_store_accepts() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;
    desk.store.fail_next_patch(Failure::PermissionDenied);

    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.firstName", "Ann")
        .await?;
    advance(2_100).await;
    assert!(desk.engine.scheduler().is_blocked(id));

    let outcome = desk.engine.flush(&desk.borrower, id).await?;
    assert_eq!(outcome, FlushOutcome::Persisted { paths: 1 });
    assert!(!desk.engine.scheduler().is_blocked(id));
    assert_eq!(desk.engine.last_save_error(id), None);

    // The timer is back in charge.
    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.lastName", "Lee")
        .await?;
    advance(2_100).await;
    assert_eq!(desk.store.patch_count(), 3);
    assert!(!desk.engine.has_unsaved_changes(id));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn refused_batch_does_not_hold_up_an_admin_delete() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;
    desk.store.fail_next_patch(Failure::PermissionDenied);

    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.firstName", "Ann")
        .await?;
    advance(2_100).await;
    assert!(desk.engine.scheduler().is_blocked(id));

    let record = desk.engine.delete(&desk.admin, id).await?;
    assert!(record.deleted);
    assert_eq!(
        record.read(&FieldPath::parse("borrowerInfo.firstName")?),
        Some(&FieldValue::from("Ann"))
    );
    desk.engine.release(&desk.admin, id).await?;
    desk.engine.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn transitions_proceed_while_the_store_keeps_refusing_edits() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;
    desk.store.fail_patches(Some(Failure::PermissionDenied));

    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.firstName", "Ann")
        .await?;
    advance(2_100).await;

    let record = desk.engine.delete(&desk.admin, id).await?;
    assert!(record.deleted);
    assert_eq!(record.read(&FieldPath::parse("borrowerInfo.firstName")?), None);
    assert!(desk.engine.has_unsaved_changes(id));

    // Shutdown gives up on the refused edits instead of keeping them forever.
    let err = desk.engine.shutdown().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(!desk.engine.has_unsaved_changes(id));
    desk.engine.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn discarding_changes_lifts_the_block() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;
    desk.store.fail_patches(Some(Failure::PermissionDenied));

    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.firstName", "Ann")
        .await?;
    advance(2_100).await;
    assert!(desk.engine.scheduler().is_blocked(id));

    assert!(desk.engine.discard_changes(&desk.borrower, id).await?);
    assert!(!desk.engine.scheduler().is_blocked(id));
    assert!(!desk.engine.has_unsaved_changes(id));
    assert_eq!(desk.engine.save_status(id), SaveStatus::Idle);

    let record = desk.engine.get_application(&desk.borrower, id).await?;
    assert_eq!(record.read(&FieldPath::parse("borrowerInfo.firstName")?), None);

    desk.store.fail_patches(None);
    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.lastName", "Lee")
        .await?;
    advance(2_100).await;
    assert!(!desk.engine.has_unsaved_changes(id));
    assert!(!desk.engine.discard_changes(&desk.borrower, id).await?);
    Ok(())
}

// ============================================================================
// Post-save refresh
// ============================================================================

#[tokio::test(start_paused = true)]
async fn completing_a_section_is_recorded_once() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;

    desk.engine
        .update_field(&desk.borrower, id, ADDRESS, "1 Elm")
        .await?;
    desk.engine
        .update_field(&desk.borrower, id, PROPERTY_TYPE, "SFR")
        .await?;
    advance(2_100).await;

    let stored = desk.stored(id).ok_or("missing record")?;
    assert_eq!(stored.progress.overall_progress, 20);
    let completed: Vec<_> = stored
        .history
        .iter()
        .filter(|e| e.action == HistoryAction::SectionCompleted)
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].details, Some(FieldValue::from("propertyInfo")));
    assert_eq!(completed[0].performed_by, desk.borrower.user_id);

    // The working copy sees the derived state too.
    let working = desk.engine.get_application(&desk.borrower, id).await?;
    assert_eq!(working.progress, stored.progress);
    assert_eq!(working.history.len(), stored.history.len());

    // Recomputing does not add a second entry.
    let progress = desk.engine.calculate_progress(&desk.borrower, id).await?;
    assert_eq!(progress.overall_progress, 20);
    let again = desk.stored(id).ok_or("missing record")?;
    assert_eq!(again.history.len(), stored.history.len());

    // Another edit within the complete section neither.
    desk.engine
        .update_field(&desk.borrower, id, PROPERTY_TYPE, "duplex")
        .await?;
    desk.engine.flush(&desk.borrower, id).await?;
    let after = desk.stored(id).ok_or("missing record")?;
    assert_eq!(after.history.len(), stored.history.len());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn clearing_a_required_field_reopens_the_section() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;

    desk.engine
        .update_field(&desk.borrower, id, ADDRESS, "1 Elm")
        .await?;
    desk.engine
        .update_field(&desk.borrower, id, PROPERTY_TYPE, "SFR")
        .await?;
    desk.engine.flush(&desk.borrower, id).await?;

    desk.engine
        .update_field(&desk.borrower, id, PROPERTY_TYPE, "  ")
        .await?;
    desk.engine.flush(&desk.borrower, id).await?;

    let stored = desk.stored(id).ok_or("missing record")?;
    assert_eq!(stored.progress.overall_progress, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn summary_history_records_each_batch() -> TestResult {
    let config = EngineConfig::from_toml_str("[autosave]\nsummary_history = true")?;
    let desk = TestDesk::with_config(config)?;
    let id = desk.create_dscr().await?;

    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.firstName", "Ann")
        .await?;
    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.lastName", "Lee")
        .await?;
    advance(2_100).await;

    let stored = desk.stored(id).ok_or("missing record")?;
    let summaries: Vec<_> = stored
        .history
        .iter()
        .filter(|e| e.action == HistoryAction::FieldsUpdated)
        .collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(
        summaries[0].details,
        Some(FieldValue::List(vec![
            FieldValue::from("borrowerInfo.firstName"),
            FieldValue::from("borrowerInfo.lastName"),
        ]))
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn no_summary_entries_by_default() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;

    desk.engine
        .update_field(&desk.borrower, id, "borrowerInfo.firstName", "Ann")
        .await?;
    desk.engine.flush(&desk.borrower, id).await?;

    let stored = desk.stored(id).ok_or("missing record")?;
    assert_eq!(stored.history.len(), 1);
    Ok(())
}
