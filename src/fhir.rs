//! FHIR resource model: just enough structure for bundles, outcomes, the
//! capability statement, and the resources synthesised for measure evaluation.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::constants;

/// A wrapped collection of subordinate requests/responses. Resource payloads
/// stay as raw JSON so they survive round-trips byte-for-byte.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "resourceType", default)]
    pub resource_type: String,
    #[serde(rename = "type", default)]
    pub bundle_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link: Vec<BundleLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<BundleEntry>,
}

impl Bundle {
    pub fn transaction(entry: Vec<BundleEntry>) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            bundle_type: "transaction".to_string(),
            total: None,
            link: Vec::new(),
            entry,
        }
    }

    pub fn batch(entry: Vec<BundleEntry>) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            bundle_type: "batch".to_string(),
            total: None,
            link: Vec::new(),
            entry,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BundleLink {
    #[serde(default)]
    pub relation: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BundleEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<BundleEntrySearch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<BundleEntryRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<BundleEntryResponse>,
}

impl BundleEntry {
    /// Entry carrying a GET request line, as used in batched searches.
    pub fn get_request(url: impl Into<String>) -> Self {
        Self {
            request: Some(BundleEntryRequest {
                method: "GET".to_string(),
                url: url.into(),
            }),
            ..Default::default()
        }
    }

    /// Entry carrying a resource to POST, as used in transactions.
    pub fn post_resource(url: impl Into<String>, resource: Box<RawValue>) -> Self {
        Self {
            resource: Some(resource),
            request: Some(BundleEntryRequest {
                method: "POST".to_string(),
                url: url.into(),
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BundleEntrySearch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BundleEntryRequest {
    pub method: String,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BundleEntryResponse {
    #[serde(default)]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Box<RawValue>>,
}

// ============================================================================
// OperationOutcome
// ============================================================================

/// Structured server error envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationOutcome {
    #[serde(default)]
    pub issue: Vec<OperationOutcomeIssue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationOutcomeIssue {
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<CodeableConcept>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expression: Vec<String>,
}

/// Issue codes the server may clear on its own; only these justify a retry.
pub fn is_transient_issue_code(code: &str) -> bool {
    matches!(
        code,
        "transient" | "lock-error" | "no-store" | "timeout" | "incomplete" | "throttled"
    )
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Coding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub fn coding(system: &str, code: &str) -> Coding {
    Coding {
        system: Some(system.to_string()),
        code: Some(code.to_string()),
    }
}

// ============================================================================
// CapabilityStatement
// ============================================================================

/// Server-published manifest of supported resource types and interactions.
#[derive(Debug, Deserialize)]
pub struct CapabilityStatement {
    #[serde(default)]
    pub rest: Vec<CapabilityStatementRest>,
}

#[derive(Debug, Deserialize)]
pub struct CapabilityStatementRest {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub resource: Vec<CapabilityStatementRestResource>,
}

#[derive(Debug, Deserialize)]
pub struct CapabilityStatementRestResource {
    #[serde(rename = "type", default)]
    pub resource_type: String,
    #[serde(default)]
    pub interaction: Vec<ResourceInteraction>,
}

impl CapabilityStatementRestResource {
    pub fn supports_search_type(&self) -> bool {
        self.interaction.iter().any(|i| i.code == "search-type")
    }
}

#[derive(Debug, Deserialize)]
pub struct ResourceInteraction {
    #[serde(default)]
    pub code: String,
}

// ============================================================================
// Parameters
// ============================================================================

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Parameters {
    #[serde(rename = "resourceType", default)]
    pub resource_type: String,
    #[serde(default)]
    pub parameter: Vec<ParametersParameter>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ParametersParameter {
    pub name: String,
    #[serde(rename = "valueCode", skip_serializing_if = "Option::is_none")]
    pub value_code: Option<String>,
}

impl Parameters {
    pub fn from_codes(pairs: &[(&str, &str)]) -> Self {
        Self {
            resource_type: "Parameters".to_string(),
            parameter: pairs
                .iter()
                .map(|(name, value)| ParametersParameter {
                    name: name.to_string(),
                    value_code: Some(value.to_string()),
                })
                .collect(),
        }
    }
}

// ============================================================================
// Measure / Library (synthesised for measure evaluation)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Measure {
    pub resource_type: String,
    pub url: String,
    pub status: String,
    pub subject_codeable_concept: CodeableConcept,
    pub library: Vec<String>,
    pub scoring: CodeableConcept,
    pub group: Vec<MeasureGroup>,
}

#[derive(Debug, Serialize)]
pub struct MeasureGroup {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    pub population: Vec<MeasureGroupPopulation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stratifier: Vec<MeasureGroupStratifier>,
}

#[derive(Debug, Serialize)]
pub struct Extension {
    pub url: String,
    #[serde(rename = "valueCode")]
    pub value_code: String,
}

#[derive(Debug, Serialize)]
pub struct MeasureGroupPopulation {
    pub code: CodeableConcept,
    pub criteria: Expression,
}

#[derive(Debug, Serialize)]
pub struct MeasureGroupStratifier {
    pub code: CodeableConcept,
    pub criteria: Expression,
}

#[derive(Debug, Serialize)]
pub struct Expression {
    pub language: String,
    pub expression: String,
}

impl Expression {
    /// CQL identifier expression, the only criteria language used here.
    pub fn cql_identifier(expression: impl Into<String>) -> Self {
        Self {
            language: "text/cql-identifier".to_string(),
            expression: expression.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    pub resource_type: String,
    pub url: String,
    pub status: String,
    #[serde(rename = "type")]
    pub library_type: CodeableConcept,
    pub content: Vec<Attachment>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    pub data: String,
}

// ============================================================================
// Error responses
// ============================================================================

/// A non-2xx response from the FHIR server: the decoded OperationOutcome when
/// the media type says the body is one, the verbatim body otherwise.
#[derive(Debug)]
pub struct ErrorResponse {
    pub status: u16,
    pub outcome: Option<OperationOutcome>,
    pub other: Option<String>,
}

impl ErrorResponse {
    /// Decodes a non-2xx response body. A response is a FHIR error iff its
    /// Content-Type begins with the FHIR JSON media type.
    pub fn from_response(status: u16, content_type: Option<&str>, body: &[u8]) -> Self {
        if content_type.is_some_and(|ct| ct.starts_with(constants::FHIR_JSON)) {
            match serde_json::from_slice::<OperationOutcome>(body) {
                Ok(outcome) => {
                    return Self {
                        status,
                        outcome: Some(outcome),
                        other: None,
                    };
                }
                Err(err) => {
                    log::debug!("undecodable operation outcome: {}", err);
                }
            }
        }
        Self {
            status,
            outcome: None,
            other: Some(String::from_utf8_lossy(body).into_owned()),
        }
    }
}
