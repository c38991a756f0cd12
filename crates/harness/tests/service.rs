use serde_json::{Value, json};

use loanrec_engine::RecordService;
use loanrec_harness::{DSCR, TestDesk};

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn call(service: &RecordService, request: Value) -> Result<Value, serde_json::Error> {
    let line = service.handle_json(&request.to_string()).await;
    serde_json::from_str(&line)
}

fn borrower() -> Value {
    json!({"userId": "borrower-1", "role": "borrower"})
}

fn broker() -> Value {
    json!({"userId": "broker-1", "role": "broker"})
}

fn admin() -> Value {
    json!({"userId": "admin-1", "role": "admin"})
}

async fn create(service: &RecordService) -> Result<String, Box<dyn std::error::Error>> {
    let response = call(
        service,
        json!({
            "op": "create_application",
            "caller": broker(),
            "ownerId": "borrower-1",
            "brokerId": "broker-1",
            "loanProgram": DSCR,
            "initialData": [{"path": "loanDetails.loanAmount", "value": 425000}],
        }),
    )
    .await?;
    assert_eq!(response["ok"], json!(true), "{response}");
    let id = response["result"]["applicationId"]
        .as_str()
        .ok_or("no application id")?;
    Ok(id.to_string())
}

// ============================================================================
// Round trips
// ============================================================================

#[tokio::test(start_paused = true)]
async fn create_edit_flush_and_read_back() -> TestResult {
    let desk = TestDesk::new()?;
    let service = RecordService::new(desk.engine.clone());
    let id = create(&service).await?;

    let response = call(
        &service,
        json!({
            "op": "update_field",
            "caller": borrower(),
            "applicationId": id,
            "path": "propertyInfo.propertyAddress",
            "value": "123 Main St",
        }),
    )
    .await?;
    assert_eq!(response, json!({"ok": true, "result": {"saveStatus": "pending"}}));

    let response = call(
        &service,
        json!({"op": "flush", "caller": borrower(), "applicationId": id}),
    )
    .await?;
    assert_eq!(
        response,
        json!({"ok": true, "result": {"persistedPaths": 1, "saveStatus": "saved"}})
    );

    let response = call(
        &service,
        json!({"op": "get_application", "caller": borrower(), "applicationId": id}),
    )
    .await?;
    let record = &response["result"];
    assert_eq!(record["id"], json!(id));
    assert_eq!(record["status"], json!("draft"));
    assert_eq!(record["loanCategory"], json!("residential"));
    assert_eq!(record["propertyInfo"]["propertyAddress"], json!("123 Main St"));
    assert_eq!(record["loanDetails"]["loanAmount"], json!(425000));
    assert_eq!(record["progress"]["overallProgress"], json!(0));
    assert_eq!(record["history"][0]["action"], json!("created"));
    assert_eq!(record["history"][0]["performedBy"], json!("broker-1"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn discarding_unsaved_edits() -> TestResult {
    let desk = TestDesk::new()?;
    let service = RecordService::new(desk.engine.clone());
    let id = create(&service).await?;

    call(
        &service,
        json!({
            "op": "update_field",
            "caller": borrower(),
            "applicationId": id,
            "path": "borrowerInfo.firstName",
            "value": "Ann",
        }),
    )
    .await?;
    let response = call(
        &service,
        json!({"op": "discard_changes", "caller": borrower(), "applicationId": id}),
    )
    .await?;
    assert_eq!(response, json!({"ok": true, "result": {"discarded": true}}));

    let response = call(
        &service,
        json!({"op": "get_application", "caller": borrower(), "applicationId": id}),
    )
    .await?;
    assert_eq!(response["result"]["borrowerInfo"]["firstName"], Value::Null);
    assert_eq!(desk.store.patch_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn batch_updates_and_progress() -> TestResult {
    let desk = TestDesk::new()?;
    let service = RecordService::new(desk.engine.clone());
    let id = create(&service).await?;

    let response = call(
        &service,
        json!({
            "op": "update_fields",
            "caller": borrower(),
            "applicationId": id,
            "updates": [
                {"path": "propertyInfo.propertyAddress", "value": "9 Oak Ave"},
                {"path": "propertyInfo.propertyType", "value": "condo"},
            ],
        }),
    )
    .await?;
    assert_eq!(response["ok"], json!(true));

    let response = call(
        &service,
        json!({"op": "calculate_progress", "caller": borrower(), "applicationId": id}),
    )
    .await?;
    assert_eq!(response["result"]["propertyInfo"], json!(true));
    assert_eq!(response["result"]["borrowerInfo"], json!(false));
    assert_eq!(response["result"]["overallProgress"], json!(20));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lifecycle_ops_return_the_record() -> TestResult {
    let desk = TestDesk::new()?;
    let service = RecordService::new(desk.engine.clone());
    let id = create(&service).await?;

    let response = call(
        &service,
        json!({"op": "submit", "caller": borrower(), "applicationId": id}),
    )
    .await?;
    assert_eq!(response["result"]["status"], json!("submitted"));

    let response = call(
        &service,
        json!({
            "op": "assign",
            "caller": admin(),
            "applicationId": id,
            "workforceId": "analyst-1",
        }),
    )
    .await?;
    assert_eq!(response["result"]["status"], json!("assigned"));
    assert_eq!(response["result"]["assignedWorkforceId"], json!("analyst-1"));

    let response = call(
        &service,
        json!({
            "op": "set_status",
            "caller": {"userId": "analyst-1", "role": "workforce"},
            "applicationId": id,
            "status": "under-review",
        }),
    )
    .await?;
    assert_eq!(response["result"]["status"], json!("under-review"));

    let response = call(
        &service,
        json!({
            "op": "list_by_assignee",
            "caller": {"userId": "analyst-1", "role": "workforce"},
            "workforceId": "analyst-1",
        }),
    )
    .await?;
    let listed = response["result"].as_array().ok_or("not a list")?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], json!(id));

    let response = call(
        &service,
        json!({"op": "delete", "caller": admin(), "applicationId": id}),
    )
    .await?;
    assert_eq!(response["result"]["deleted"], json!(true));
    assert_eq!(response["result"]["status"], json!("under-review"));

    let response = call(
        &service,
        json!({"op": "list_by_broker", "caller": broker(), "brokerId": "broker-1"}),
    )
    .await?;
    assert_eq!(response["result"], json!([]));

    let response = call(
        &service,
        json!({"op": "restore", "caller": admin(), "applicationId": id}),
    )
    .await?;
    assert_eq!(response["result"]["deleted"], json!(false));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn custom_history_entries() -> TestResult {
    let desk = TestDesk::new()?;
    let service = RecordService::new(desk.engine.clone());
    let id = create(&service).await?;

    let response = call(
        &service,
        json!({
            "op": "add_history_entry",
            "caller": broker(),
            "applicationId": id,
            "action": "checklist_generated",
            "description": "Document checklist generated",
            "details": {"items": 7},
        }),
    )
    .await?;
    assert_eq!(response["result"]["action"], json!("checklist_generated"));
    assert_eq!(response["result"]["details"], json!({"items": 7}));

    let response = call(
        &service,
        json!({"op": "get_application", "caller": broker(), "applicationId": id}),
    )
    .await?;
    let history = response["result"]["history"].as_array().ok_or("no history")?;
    assert_eq!(history.len(), 2);
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test(start_paused = true)]
async fn every_failure_carries_a_kind() -> TestResult {
    let desk = TestDesk::new()?;
    let service = RecordService::new(desk.engine.clone());
    let id = create(&service).await?;
    let missing = "00000000-0000-4000-8000-000000000000";

    let cases = [
        (
            json!({"op": "get_application", "caller": admin(), "applicationId": missing}),
            "not-found",
        ),
        (
            json!({
                "op": "get_application",
                "caller": {"userId": "borrower-2", "role": "borrower"},
                "applicationId": id,
            }),
            "permission-denied",
        ),
        (
            json!({"op": "restore", "caller": admin(), "applicationId": id}),
            "invalid-transition",
        ),
        (
            json!({
                "op": "update_field",
                "caller": borrower(),
                "applicationId": id,
                "path": "status",
                "value": "approved",
            }),
            "validation-error",
        ),
        (
            json!({
                "op": "update_field",
                "caller": borrower(),
                "applicationId": id,
                "path": "loanDetails.loanAmount",
                "value": "a lot",
            }),
            "validation-error",
        ),
        (json!({"op": "launch_rocket"}), "validation-error"),
    ];

    for (request, kind) in cases {
        let response = call(&service, request.clone()).await?;
        assert_eq!(response["ok"], json!(false), "{request}");
        assert_eq!(response["error"]["kind"], json!(kind), "{request}");
        assert!(response["error"]["message"].as_str().is_some_and(|m| !m.is_empty()));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn malformed_json_is_a_validation_error() -> TestResult {
    let desk = TestDesk::new()?;
    let service = RecordService::new(desk.engine.clone());

    let line = service.handle_json("{not json").await;
    let response: Value = serde_json::from_str(&line)?;
    assert_eq!(response["error"]["kind"], json!("validation-error"));
    Ok(())
}
