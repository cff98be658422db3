use blazectl::client::{Auth, FhirClient};
use wiremock::MockServer;

pub async fn start_server() -> MockServer {
    MockServer::start().await
}

pub fn client_for(server: &MockServer) -> FhirClient {
    FhirClient::new(&server.uri(), Auth::None).unwrap()
}

#[allow(dead_code)]
pub fn operation_outcome(severity: &str, code: &str) -> String {
    format!(
        r#"{{"resourceType": "OperationOutcome",
            "issue": [{{"severity": "{}", "code": "{}"}}]}}"#,
        severity, code
    )
}
