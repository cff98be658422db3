use blazectl::client::OperationOutcomeError;
use blazectl::measure::{evaluate_measure, evaluate_measure_with_retry};
use tokio::sync::watch;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

mod common;

fn measure_report_batch_response() -> String {
    r#"{
        "resourceType": "Bundle",
        "type": "batch-response",
        "entry": [{
            "resource": {"resourceType": "MeasureReport", "status": "complete"},
            "response": {"status": "200 OK"}
        }]
    }"#
    .to_string()
}

fn no_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    // Keep the sender alive for the whole test.
    std::mem::forget(tx);
    rx
}

#[tokio::test]
async fn test_poll_async_status_retries_on_202() {
    let server = common::start_server().await;

    Mock::given(method("GET"))
        .and(path("/__async-status/x"))
        .respond_with(ResponseTemplate::new(202))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/__async-status/x"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            measure_report_batch_response(),
            "application/fhir+json",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let location = format!("{}/__async-status/x", server.uri());
    let payload = client
        .poll_async_status(&location, no_interrupt())
        .await
        .unwrap();

    let report: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!("MeasureReport", report["resourceType"]);
}

#[tokio::test]
async fn test_poll_async_status_decodes_error_entries() {
    let server = common::start_server().await;

    let body = format!(
        r#"{{"resourceType": "Bundle", "type": "batch-response",
            "entry": [{{"response": {{"status": "500", "outcome": {}}}}}]}}"#,
        common::operation_outcome("error", "exception")
    );
    Mock::given(method("GET"))
        .and(path("/__async-status/x"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/fhir+json"))
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let location = format!("{}/__async-status/x", server.uri());
    let err = client
        .poll_async_status(&location, no_interrupt())
        .await
        .unwrap_err();

    let outcome_err = err.downcast_ref::<OperationOutcomeError>().unwrap();
    assert_eq!("exception", outcome_err.outcome.issue[0].code);
}

#[tokio::test]
async fn test_poll_async_status_cancellation_issues_delete() {
    let server = common::start_server().await;

    Mock::given(method("GET"))
        .and(path("/__async-status/x"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/__async-status/x"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let _ = interrupt_tx.send(true);
    });

    let client = common::client_for(&server);
    let location = format!("{}/__async-status/x", server.uri());
    let err = client
        .poll_async_status(&location, interrupt_rx)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("cancelled"));
}

#[tokio::test]
async fn test_evaluate_measure_async_path() {
    let server = common::start_server().await;
    let location = format!("{}/__async-status/eval", server.uri());

    Mock::given(method("GET"))
        .and(path("/Measure/$evaluate-measure"))
        .and(query_param("measure", "urn:uuid:test"))
        .and(query_param("periodStart", "1900"))
        .and(query_param("periodEnd", "2200"))
        .and(header("Prefer", "respond-async"))
        .respond_with(ResponseTemplate::new(202).insert_header("Content-Location", location.as_str()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/__async-status/eval"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            measure_report_batch_response(),
            "application/fhir+json",
        ))
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let payload = evaluate_measure(&client, "urn:uuid:test", false, no_interrupt())
        .await
        .unwrap();

    let report: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!("MeasureReport", report["resourceType"]);
}

#[tokio::test]
async fn test_evaluate_measure_sync_path_forces_no_async_preference() {
    let server = common::start_server().await;

    Mock::given(method("GET"))
        .and(path("/Measure/$evaluate-measure"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"resourceType": "MeasureReport", "status": "complete"}"#,
            "application/fhir+json",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let payload = evaluate_measure(&client, "urn:uuid:test", true, no_interrupt())
        .await
        .unwrap();
    assert!(!payload.is_empty());

    // The sync path must not ask for an async response.
    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| !r.headers.contains_key("Prefer")));
}

#[tokio::test]
async fn test_evaluate_measure_retries_transient_failures() {
    let server = common::start_server().await;

    Mock::given(method("GET"))
        .and(path("/Measure/$evaluate-measure"))
        .respond_with(
            ResponseTemplate::new(503)
                .set_body_raw(common::operation_outcome("error", "timeout"), "application/fhir+json"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Measure/$evaluate-measure"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"resourceType": "MeasureReport", "status": "complete"}"#,
            "application/fhir+json",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let payload = evaluate_measure_with_retry(&client, "urn:uuid:test", true, no_interrupt())
        .await
        .unwrap();

    let report: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!("MeasureReport", report["resourceType"]);
}

#[tokio::test]
async fn test_evaluate_measure_does_not_retry_permanent_failures() {
    let server = common::start_server().await;

    Mock::given(method("GET"))
        .and(path("/Measure/$evaluate-measure"))
        .respond_with(
            ResponseTemplate::new(422)
                .set_body_raw(common::operation_outcome("error", "invalid"), "application/fhir+json"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = common::client_for(&server);
    let err = evaluate_measure_with_retry(&client, "urn:uuid:test", true, no_interrupt())
        .await
        .unwrap_err();

    let outcome_err = err.downcast_ref::<OperationOutcomeError>().unwrap();
    assert_eq!("invalid", outcome_err.outcome.issue[0].code);
}
