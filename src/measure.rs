//! Measure evaluation: synthesises Measure and Library resources from a
//! declarative YAML specification, submits them in one transaction, and
//! drives the `$evaluate-measure` operation, synchronously or via the
//! asynchronous polling loop.

use anyhow::{Context, Result, bail};
use base64::Engine;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;

use crate::client::{FhirClient, OperationOutcomeError, content_location};
use crate::constants;
use crate::fhir::{
    Attachment, Bundle, BundleEntry, CodeableConcept, Expression, Extension, Library, Measure,
    MeasureGroup, MeasureGroupPopulation, MeasureGroupStratifier, coding,
};

/// Declarative measure specification read from a YAML file.
#[derive(Debug, Default, Deserialize)]
pub struct MeasureFile {
    #[serde(default)]
    pub library: String,
    #[serde(default)]
    pub group: Vec<GroupSpec>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GroupSpec {
    #[serde(rename = "type", default)]
    pub group_type: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub population: Vec<PopulationSpec>,
    #[serde(default)]
    pub stratifier: Vec<StratifierSpec>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PopulationSpec {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub expression: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StratifierSpec {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expression: String,
}

pub fn read_measure_file(path: &Path) -> Result<MeasureFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("error while reading the measure file {}", path.display()))?;
    serde_yaml::from_str(&content).context("error while parsing the measure file")
}

/// A fresh canonical URL under which a synthesised resource is created.
pub fn random_canonical_url() -> String {
    format!("urn:uuid:{}", uuid::Uuid::new_v4())
}

pub fn create_measure_resource(
    m: &MeasureFile,
    measure_url: &str,
    library_url: &str,
) -> Result<Measure> {
    if m.group.is_empty() {
        bail!("missing group");
    }

    let mut groups = Vec::with_capacity(m.group.len());
    for (i, group) in m.group.iter().enumerate() {
        let group = create_measure_group(group).map_err(|err| {
            anyhow::anyhow!("error in group[{}]: {}", i, err)
        })?;
        groups.push(group);
    }

    Ok(Measure {
        resource_type: "Measure".to_string(),
        url: measure_url.to_string(),
        status: "active".to_string(),
        subject_codeable_concept: CodeableConcept {
            coding: vec![coding("http://hl7.org/fhir/resource-types", "Patient")],
            text: None,
        },
        library: vec![library_url.to_string()],
        scoring: CodeableConcept {
            coding: vec![coding(
                "http://terminology.hl7.org/CodeSystem/measure-scoring",
                "cohort",
            )],
            text: None,
        },
        group: groups,
    })
}

fn create_measure_group(g: &GroupSpec) -> Result<MeasureGroup> {
    if g.population.is_empty() {
        bail!("missing population");
    }

    // Non-Patient groups carry their population basis as an extension.
    let extension = if g.group_type != "Patient" {
        vec![Extension {
            url: "http://hl7.org/fhir/us/cqfmeasures/StructureDefinition/cqfm-populationBasis"
                .to_string(),
            value_code: g.group_type.clone(),
        }]
    } else {
        Vec::new()
    };

    let mut population = Vec::with_capacity(g.population.len());
    for (i, p) in g.population.iter().enumerate() {
        population.push(
            create_measure_group_population(p)
                .map_err(|err| anyhow::anyhow!("population[{}]: {}", i, err))?,
        );
    }

    let mut stratifier = Vec::with_capacity(g.stratifier.len());
    for (i, s) in g.stratifier.iter().enumerate() {
        stratifier.push(
            create_measure_group_stratifier(s)
                .map_err(|err| anyhow::anyhow!("stratifier[{}]: {}", i, err))?,
        );
    }

    Ok(MeasureGroup {
        extension,
        population,
        stratifier,
    })
}

fn create_measure_group_population(p: &PopulationSpec) -> Result<MeasureGroupPopulation> {
    if p.expression.is_empty() {
        bail!("missing expression name");
    }
    Ok(MeasureGroupPopulation {
        code: CodeableConcept {
            coding: vec![coding(
                "http://terminology.hl7.org/CodeSystem/measure-population",
                "initial-population",
            )],
            text: None,
        },
        criteria: Expression::cql_identifier(&p.expression),
    })
}

fn create_measure_group_stratifier(s: &StratifierSpec) -> Result<MeasureGroupStratifier> {
    if s.code.is_empty() {
        bail!("missing code");
    }
    if s.expression.is_empty() {
        bail!("missing expression name");
    }
    Ok(MeasureGroupStratifier {
        code: CodeableConcept {
            coding: Vec::new(),
            text: Some(s.code.clone()),
        },
        criteria: Expression::cql_identifier(&s.expression),
    })
}

pub fn create_library_resource(m: &MeasureFile, library_url: &str) -> Result<Library> {
    if m.library.is_empty() {
        bail!("error while reading the measure file: missing CQL library filename");
    }
    let cql = std::fs::read(&m.library).context("error while reading the CQL library file")?;
    Ok(Library {
        resource_type: "Library".to_string(),
        url: library_url.to_string(),
        status: "active".to_string(),
        library_type: CodeableConcept {
            coding: vec![coding(
                "http://terminology.hl7.org/CodeSystem/library-type",
                "logic-library",
            )],
            text: None,
        },
        content: vec![Attachment {
            content_type: "text/cql".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(cql),
        }],
    })
}

/// The transaction bundle creating the Library and Measure resources.
pub fn evaluation_bundle(measure: &Measure, library: &Library) -> Result<Bundle> {
    let library_raw = serde_json::value::to_raw_value(library)?;
    let measure_raw = serde_json::value::to_raw_value(measure)?;
    Ok(Bundle::transaction(vec![
        BundleEntry::post_resource("Library", library_raw),
        BundleEntry::post_resource("Measure", measure_raw),
    ]))
}

/// Submits the transaction bundle that creates both resources.
pub async fn submit_resources(client: &FhirClient, bundle: &Bundle) -> Result<()> {
    let body = serde_json::to_vec(bundle)?;
    let resp = client.send_timed(client.transaction_request(body)).await?;
    if resp.status.as_u16() != 200 {
        return Err(client.response_error(&resp))
            .context("error while creating the Measure and Library resources");
    }
    Ok(())
}

/// Evaluates the measure with the given canonical URL. The server may
/// answer synchronously or hand out a `202 Accepted` with a polling
/// location; both paths return the raw MeasureReport payload.
pub async fn evaluate_measure(
    client: &FhirClient,
    measure_url: &str,
    force_sync: bool,
    interrupt: watch::Receiver<bool>,
) -> Result<Vec<u8>> {
    let req = client.type_operation_request(
        "Measure",
        "evaluate-measure",
        !force_sync,
        &[
            ("measure", measure_url),
            ("periodStart", "1900"),
            ("periodEnd", "2200"),
        ],
    );
    let resp = client.send_timed(req).await?;

    match resp.status.as_u16() {
        200 => Ok(resp.body),
        202 => {
            // 202 body was drained by send_timed.
            let location = content_location(&resp.headers)?;
            client.poll_async_status(&location, interrupt).await
        }
        _ => Err(client.response_error(&resp)),
    }
}

/// Retries evaluation while the server reports a transient outcome,
/// doubling the backoff from 100 ms under a 5 s total sleep budget.
pub async fn evaluate_measure_with_retry(
    client: &FhirClient,
    measure_url: &str,
    force_sync: bool,
    interrupt: watch::Receiver<bool>,
) -> Result<Vec<u8>> {
    let budget = Duration::from_secs(constants::RETRY_BUDGET_SECS);
    let mut wait = Duration::from_millis(constants::RETRY_INITIAL_WAIT_MS);
    let mut slept = Duration::ZERO;

    loop {
        let result = evaluate_measure(client, measure_url, force_sync, interrupt.clone()).await;
        let retry = matches!(&result, Err(err) if is_retryable(err)) && slept + wait < budget;
        if !retry {
            return result;
        }
        eprintln!("Retry evaluating the measure...");
        tokio::time::sleep(wait).await;
        slept += wait;
        wait *= 2;
    }
}

fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<OperationOutcomeError>()
        .is_some_and(|err| err.is_transient())
}
