//! Resource counting: collects the search-type resource types from the
//! capability statement and counts all of them with a single batched search.

use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;

use crate::client::FhirClient;
use crate::fhir::{Bundle, BundleEntry, CapabilityStatement};

/// Counts all resources by type. One `{Type}?_summary=count` search per
/// supported type, batched into a single request.
pub async fn count_resources(client: &FhirClient) -> Result<BTreeMap<String, u64>> {
    let resp = client.send_timed(client.capabilities_request()).await?;
    if resp.status.as_u16() != 200 {
        return Err(client.response_error(&resp))
            .context("error while fetching the capability statement");
    }
    let capability: CapabilityStatement = serde_json::from_slice(&resp.body)
        .context("error while parsing the capability statement")?;

    let resource_types = search_type_resources(&capability);
    if resource_types.is_empty() {
        return Ok(BTreeMap::new());
    }

    let entries = resource_types
        .iter()
        .map(|t| BundleEntry::get_request(format!("{}?_summary=count", t)))
        .collect();
    let body = serde_json::to_vec(&Bundle::batch(entries))?;

    let resp = client.send_timed(client.transaction_request(body)).await?;
    if resp.status.as_u16() != 200 {
        return Err(client.response_error(&resp)).context("error while counting resources");
    }
    let response_bundle: Bundle = serde_json::from_slice(&resp.body)
        .context("error while parsing the count response bundle")?;

    if response_bundle.entry.len() != resource_types.len() {
        bail!(
            "expected {} entries in the count response bundle but were {}",
            resource_types.len(),
            response_bundle.entry.len()
        );
    }

    let mut counts = BTreeMap::new();
    for (resource_type, entry) in resource_types.into_iter().zip(response_bundle.entry) {
        let response = entry
            .response
            .with_context(|| format!("missing response in the count entry of {}", resource_type))?;
        if !response.status.starts_with("200") {
            bail!(
                "counting {} failed with status {}",
                resource_type,
                response.status
            );
        }
        let resource = entry
            .resource
            .with_context(|| format!("missing result bundle in the count entry of {}", resource_type))?;
        let result: Bundle = serde_json::from_str(resource.get())
            .with_context(|| format!("error while parsing the count result of {}", resource_type))?;
        if result.bundle_type != "searchset" {
            bail!(
                "expected a searchset bundle in the count entry of {} but was `{}`",
                resource_type,
                result.bundle_type
            );
        }
        let total = result
            .total
            .with_context(|| format!("missing total in the count result of {}", resource_type))?;
        counts.insert(resource_type, total);
    }

    Ok(counts)
}

/// The resource types advertised with a `search-type` interaction by any
/// server-mode rest entry.
fn search_type_resources(capability: &CapabilityStatement) -> Vec<String> {
    let mut resource_types = Vec::new();
    for rest in &capability.rest {
        if rest.mode != "server" {
            continue;
        }
        for resource in &rest.resource {
            if resource.supports_search_type() {
                resource_types.push(resource.resource_type.clone());
            }
        }
    }
    resource_types
}

/// Renders counts as aligned `{type} : {count}` rows sorted by type name,
/// followed by a sum row.
pub fn render_counts(counts: &BTreeMap<String, u64>) -> String {
    let width = counts
        .keys()
        .map(|t| t.len())
        .max()
        .unwrap_or(0)
        .max("total".len());

    let mut out = String::new();
    for (resource_type, count) in counts {
        out.push_str(&format!("{:<width$} : {}\n", resource_type, count));
    }
    out.push_str(&format!("{}\n", "-".repeat(width)));
    out.push_str(&format!(
        "{:<width$} : {}\n",
        "total",
        counts.values().sum::<u64>()
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_type_resources() {
        let capability: CapabilityStatement = serde_json::from_str(
            r#"{
                "resourceType": "CapabilityStatement",
                "rest": [{
                    "mode": "server",
                    "resource": [
                        {"type": "Patient", "interaction": [{"code": "read"}, {"code": "search-type"}]},
                        {"type": "Binary", "interaction": [{"code": "read"}]},
                        {"type": "Observation", "interaction": [{"code": "search-type"}]}
                    ]
                }, {
                    "mode": "client",
                    "resource": [{"type": "Device", "interaction": [{"code": "search-type"}]}]
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(
            vec!["Patient".to_string(), "Observation".to_string()],
            search_type_resources(&capability)
        );
    }

    #[test]
    fn test_render_counts_aligns_to_longest_type_name() {
        let counts =
            BTreeMap::from([("Patient".to_string(), 10), ("Observation".to_string(), 3)]);
        assert_eq!(
            "Observation : 3\n\
             Patient     : 10\n\
             -----------\n\
             total       : 13\n",
            render_counts(&counts)
        );
    }
}
