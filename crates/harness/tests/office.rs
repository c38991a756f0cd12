//! Independent engines sharing one store, as two browser sessions would.

use loanrec_core::{FieldPath, FieldValue};
use loanrec_engine::FlushOutcome;
use loanrec_harness::TestOffice;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::test(start_paused = true)]
async fn last_flush_wins() -> TestResult {
    let mut office = TestOffice::default();
    let a = office.add_desk()?;
    let b = office.add_desk()?;
    let id = office.desk(a).create_dscr().await?;
    let name = FieldPath::parse("borrowerInfo.firstName")?;

    let desk_a = office.desk(a);
    let desk_b = office.desk(b);
    desk_a
        .engine
        .update_field(&desk_a.borrower, id, name.as_str(), "Ann")
        .await?;
    desk_b
        .engine
        .update_field(&desk_b.broker, id, name.as_str(), "Anne")
        .await?;

    desk_a.engine.flush(&desk_a.borrower, id).await?;
    desk_b.engine.flush(&desk_b.broker, id).await?;

    let stored = office.store().inner().record(id).ok_or("missing record")?;
    assert_eq!(stored.read(&name), Some(&FieldValue::from("Anne")));
    assert_eq!(office.store().patch_count(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disjoint_edits_from_two_desks_both_land() -> TestResult {
    let mut office = TestOffice::default();
    let a = office.add_desk()?;
    let b = office.add_desk()?;
    let id = office.desk(a).create_dscr().await?;

    let desk_a = office.desk(a);
    let desk_b = office.desk(b);
    desk_a
        .engine
        .update_field(&desk_a.borrower, id, "borrowerInfo.firstName", "Ann")
        .await?;
    desk_b
        .engine
        .update_field(&desk_b.broker, id, "loanDetails.loanPurpose", "purchase")
        .await?;
    tokio::time::sleep(std::time::Duration::from_millis(2_100)).await;

    let stored = office.store().inner().record(id).ok_or("missing record")?;
    assert_eq!(
        stored.read(&FieldPath::parse("borrowerInfo.firstName")?),
        Some(&FieldValue::from("Ann"))
    );
    assert_eq!(
        stored.read(&FieldPath::parse("loanDetails.loanPurpose")?),
        Some(&FieldValue::from("purchase"))
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn a_fresh_desk_reads_what_another_persisted() -> TestResult {
    let mut office = TestOffice::default();
    let a = office.add_desk()?;
    let id = office.desk(a).create_dscr().await?;
    {
        let desk = office.desk(a);
        desk.engine
            .update_field(&desk.borrower, id, "borrowerInfo.email", "ann@example.com")
            .await?;
        desk.engine.flush(&desk.borrower, id).await?;
    }

    let b = office.add_desk()?;
    let desk = office.desk(b);
    let record = desk.engine.get_application(&desk.borrower, id).await?;
    assert_eq!(
        record.read(&FieldPath::parse("borrowerInfo.email")?),
        Some(&FieldValue::from("ann@example.com"))
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rewriting_a_value_another_desk_overwrote_reaches_the_store() -> TestResult {
    let mut office = TestOffice::default();
    let a = office.add_desk()?;
    let b = office.add_desk()?;
    let id = office.desk(a).create_dscr().await?;
    let name = FieldPath::parse("borrowerInfo.firstName")?;

    let desk_a = office.desk(a);
    let desk_b = office.desk(b);
    desk_a
        .engine
        .update_field(&desk_a.borrower, id, name.as_str(), "Ann")
        .await?;
    desk_a.engine.flush(&desk_a.borrower, id).await?;
    desk_b
        .engine
        .update_field(&desk_b.broker, id, name.as_str(), "Anne")
        .await?;
    desk_b.engine.flush(&desk_b.broker, id).await?;

    // Desk A's own snapshot already says "Ann"; the store does not.
    desk_a
        .engine
        .update_field(&desk_a.borrower, id, name.as_str(), "Ann")
        .await?;
    let outcome = desk_a.engine.flush(&desk_a.borrower, id).await?;

    assert_eq!(outcome, FlushOutcome::Persisted { paths: 1 });
    let stored = office.store().inner().record(id).ok_or("missing record")?;
    assert_eq!(stored.read(&name), Some(&FieldValue::from("Ann")));
    assert_eq!(office.store().patch_count(), 3);
    assert!(!desk_a.engine.has_unsaved_changes(id));
    Ok(())
}
