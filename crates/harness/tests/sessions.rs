use std::time::Duration;

use loanrec_core::{FieldPath, FieldValue};
use loanrec_engine::{EngineError, ErrorKind, SaveStatus};
use loanrec_harness::{Failure, TestDesk};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const FIRST_NAME: &str = "borrowerInfo.firstName";

fn stored_first_name(desk: &TestDesk, id: loanrec_core::ApplicationId) -> Option<FieldValue> {
    let path = FieldPath::parse(FIRST_NAME).ok()?;
    desk.stored(id)?.read(&path).cloned()
}

#[tokio::test(start_paused = true)]
async fn close_flushes_pending_edits() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;

    let session = desk.engine.open_session(&desk.borrower, id).await?;
    assert_eq!(session.application_id(), id);
    session.update_field(FIRST_NAME, "Ann").await?;
    assert!(session.has_unsaved_changes());
    assert_eq!(session.save_status(), SaveStatus::Pending);
    assert_eq!(stored_first_name(&desk, id), None);

    session.close().await?;
    assert_eq!(stored_first_name(&desk, id), Some(FieldValue::from("Ann")));
    assert_eq!(desk.store.patch_count(), 1);
    assert!(!desk.engine.has_unsaved_changes(id));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropping_a_session_still_flushes() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;

    {
        let session = desk.engine.open_session(&desk.borrower, id).await?;
        session.update_field(FIRST_NAME, "Ann").await?;
    }
    // The release task runs on the next scheduler turn, well before the
    // debounce timer would have fired.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(stored_first_name(&desk, id), Some(FieldValue::from("Ann")));
    assert_eq!(desk.store.patch_count(), 1);
    Ok(())
}

async fn edit_then_bail(desk: &TestDesk, id: loanrec_core::ApplicationId) -> Result<(), EngineError> {
    let session = desk.engine.open_session(&desk.borrower, id).await?;
    session.update_field(FIRST_NAME, "Ann").await?;
    // Rejected by the manifest; `?` drops the session.
    session.update_field("financialInfo.reserves", "lots").await?;
    session.close().await
}

#[tokio::test(start_paused = true)]
async fn early_return_does_not_lose_edits() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;

    let err = edit_then_bail(&desk, id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(stored_first_name(&desk, id), Some(FieldValue::from("Ann")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_close_keeps_the_batch() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;
    desk.store.fail_next_patch(Failure::Unavailable);

    let session = desk.engine.open_session(&desk.borrower, id).await?;
    session.update_field(FIRST_NAME, "Ann").await?;
    let err = session.close().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert!(desk.engine.has_unsaved_changes(id));

    // The working copy survived; a plain flush retries it.
    let working = desk.engine.get_application(&desk.borrower, id).await?;
    assert_eq!(
        working.read(&FieldPath::parse(FIRST_NAME)?),
        Some(&FieldValue::from("Ann"))
    );
    desk.engine.flush(&desk.borrower, id).await?;
    assert_eq!(stored_first_name(&desk, id), Some(FieldValue::from("Ann")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sessions_require_edit_rights() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;

    let err = desk
        .engine
        .open_session(&desk.analyst, id)
        .await
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reopening_after_close_reads_persisted_state() -> TestResult {
    let desk = TestDesk::new()?;
    let id = desk.create_dscr().await?;

    let session = desk.engine.open_session(&desk.borrower, id).await?;
    session.update_field(FIRST_NAME, "Ann").await?;
    session.close().await?;

    let gets = desk.store.calls("get");
    let session = desk.engine.open_session(&desk.borrower, id).await?;
    let record = session.record().await?;
    assert_eq!(desk.store.calls("get"), gets + 1);
    assert_eq!(
        record.read(&FieldPath::parse(FIRST_NAME)?),
        Some(&FieldValue::from("Ann"))
    );
    session.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_every_working_copy() -> TestResult {
    let desk = TestDesk::new()?;
    let first = desk.create_dscr().await?;
    let second = desk.create_dscr().await?;

    desk.engine
        .update_field(&desk.borrower, first, FIRST_NAME, "Ann")
        .await?;
    desk.engine
        .update_field(&desk.borrower, second, FIRST_NAME, "Bea")
        .await?;
    desk.engine.shutdown().await?;

    assert_eq!(stored_first_name(&desk, first), Some(FieldValue::from("Ann")));
    assert_eq!(stored_first_name(&desk, second), Some(FieldValue::from("Bea")));
    assert!(!desk.engine.has_unsaved_changes(first));
    assert!(!desk.engine.has_unsaved_changes(second));
    Ok(())
}
