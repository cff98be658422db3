//! Paginated resource download: a page streamer that follows next links
//! until exhaustion and the writer that turns bundle entries into NDJSON.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::client::{FhirClient, content_type};
use crate::fhir::{BundleEntry, BundleLink, ErrorResponse, OperationOutcome};
use crate::stats::{
    calculate_duration_statistics, fmt_bytes_human, fmt_duration_human, fmt_error_response,
    fmt_operation_outcomes, indent,
};

/// Network statistics of one downloaded page.
#[derive(Debug, Clone, Copy)]
pub struct PageStats {
    pub request_duration: f64,
    pub processing_duration: f64,
    pub bytes_in: u64,
}

/// The result of downloading a single page: the raw, unparsed bundle body
/// plus either page statistics or the error that ended the stream.
#[derive(Debug)]
pub struct DownloadBundle {
    pub url: String,
    pub body: Vec<u8>,
    pub stats: Option<PageStats>,
    pub error: Option<String>,
    pub error_response: Option<ErrorResponse>,
}

impl DownloadBundle {
    fn from_error(error: String) -> Self {
        Self {
            url: String::new(),
            body: Vec::new(),
            stats: None,
            error: Some(error),
            error_response: None,
        }
    }
}

/// Follows pagination links starting from the given request, emitting one
/// result per page. The channel is closed when the sequence terminates,
/// either by exhaustion or by the first error. Next-page requests always
/// use GET, also when the initial search used POST.
pub async fn expand_pages(
    client: &FhirClient,
    initial: reqwest::RequestBuilder,
    pages: mpsc::Sender<DownloadBundle>,
) {
    let mut request = match initial.build() {
        Ok(req) => Some(req),
        Err(err) => {
            let _ = pages
                .send(DownloadBundle::from_error(format!(
                    "could not create FHIR server request: {:#}",
                    err
                )))
                .await;
            return;
        }
    };

    while let Some(req) = request.take() {
        let url = req.url().to_string();

        let resp = match client.execute_timed(req).await {
            Ok(resp) => resp,
            Err(err) => {
                let _ = pages
                    .send(DownloadBundle::from_error(format!(
                        "could not request the FHIR server with URL {}: {:#}",
                        url, err
                    )))
                    .await;
                return;
            }
        };

        let stats = PageStats {
            request_duration: resp.stats.request_duration,
            processing_duration: resp.stats.processing_duration,
            bytes_in: resp.body.len() as u64,
        };

        if resp.status.as_u16() != 200 {
            let error_response = ErrorResponse::from_response(
                resp.status.as_u16(),
                content_type(&resp.headers),
                &resp.body,
            );
            let _ = pages
                .send(DownloadBundle {
                    url: url.clone(),
                    body: Vec::new(),
                    stats: Some(stats),
                    error: Some(format!(
                        "request to FHIR server with URL {} had a non-ok response status ({})",
                        url, resp.status
                    )),
                    error_response: Some(error_response),
                })
                .await;
            return;
        }

        let next = match next_link(&resp.headers, &resp.body) {
            Ok(next) => next,
            Err(err) => {
                let _ = pages
                    .send(DownloadBundle::from_error(format!(
                        "could not parse the next page link within the FHIR server response \
                         after request to URL {}: {:#}",
                        url, err
                    )))
                    .await;
                return;
            }
        };

        if pages
            .send(DownloadBundle {
                url,
                body: resp.body,
                stats: Some(stats),
                error: None,
                error_response: None,
            })
            .await
            .is_err()
        {
            return;
        }

        request = match next {
            Some(next_url) => match client.paginated_request(&next_url).build() {
                Ok(req) => Some(req),
                Err(err) => {
                    let _ = pages
                        .send(DownloadBundle::from_error(format!(
                            "could not create FHIR server request for URL {}: {:#}",
                            next_url, err
                        )))
                        .await;
                    return;
                }
            },
            None => None,
        };
    }
}

/// Extracts the URL of the next page. A `Link` response header takes
/// precedence; otherwise the bundle's in-body links are inspected for a
/// `next` relation.
fn next_link(headers: &reqwest::header::HeaderMap, body: &[u8]) -> Result<Option<String>> {
    let mut header_seen = false;
    for value in headers.get_all("Link") {
        header_seen = true;
        let value = value.to_str().context("non-ASCII Link header")?;
        if let Some(url) = next_from_link_header(value) {
            reqwest::Url::parse(&url).with_context(|| format!("invalid next link `{}`", url))?;
            return Ok(Some(url));
        }
    }
    if header_seen {
        return Ok(None);
    }

    #[derive(Deserialize)]
    struct PageLinks {
        #[serde(default)]
        link: Vec<BundleLink>,
    }

    let links: PageLinks =
        serde_json::from_slice(body).context("could not parse the response bundle")?;
    for link in links.link {
        if link.relation == "next" {
            reqwest::Url::parse(&link.url)
                .with_context(|| format!("invalid next link `{}`", link.url))?;
            return Ok(Some(link.url));
        }
    }
    Ok(None)
}

/// Finds the first `rel="next"` target in an RFC 8288 Link header value.
/// Commas inside `<...>` do not split entries.
fn next_from_link_header(value: &str) -> Option<String> {
    for entry in split_link_entries(value) {
        let Some(rest) = entry.trim().strip_prefix('<') else {
            continue;
        };
        let Some((target, params)) = rest.split_once('>') else {
            continue;
        };
        let is_next = params.split(';').any(|param| match param.split_once('=') {
            Some((name, val)) if name.trim() == "rel" => {
                let val = val.trim().trim_matches('"');
                val.split_whitespace().any(|rel| rel == "next")
            }
            _ => false,
        });
        if is_next {
            return Some(target.to_string());
        }
    }
    None
}

fn split_link_entries(value: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut in_target = false;
    let mut start = 0;
    for (idx, c) in value.char_indices() {
        match c {
            '<' => in_target = true,
            '>' => in_target = false,
            ',' if !in_target => {
                entries.push(&value[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    entries.push(&value[start..]);
    entries
}

/// Writes the resources of a page to the sink as newline-delimited compact
/// JSON. Entries without a resource are skipped; entries whose search mode
/// is `outcome` are decoded and returned as inline outcomes instead of
/// being written.
pub fn write_resources(
    body: &[u8],
    sink: &mut dyn Write,
) -> Result<(usize, Vec<OperationOutcome>)> {
    #[derive(Deserialize)]
    struct PageEntries {
        #[serde(default)]
        entry: Vec<BundleEntry>,
    }

    let page: PageEntries =
        serde_json::from_slice(body).context("could not parse the bundle entries")?;

    let mut resources = 0;
    let mut inline_outcomes = Vec::new();

    for entry in page.entry {
        let Some(resource) = entry.resource else {
            continue;
        };

        if entry.search.as_ref().and_then(|s| s.mode.as_deref()) == Some("outcome") {
            let outcome: OperationOutcome = serde_json::from_str(resource.get())
                .context("could not parse an encountered inline outcome")?;
            inline_outcomes.push(outcome);
            continue;
        }

        let value: serde_json::Value = serde_json::from_str(resource.get())
            .context("could not parse a resource of the response bundle")?;
        let compact = serde_json::to_string(&value)?;
        sink.write_all(compact.as_bytes())?;
        sink.write_all(b"\n")?;
        resources += 1;
    }

    Ok((resources, inline_outcomes))
}

/// Statistics of one download command run, folded over all pages.
#[derive(Debug, Default)]
pub struct CommandStats {
    pub total_pages: usize,
    pub resources_per_page: Vec<usize>,
    pub request_durations: Vec<f64>,
    pub processing_durations: Vec<f64>,
    pub total_bytes_in: u64,
    pub total_duration: Duration,
    pub inline_outcomes: Vec<OperationOutcome>,
    pub error: Option<ErrorResponse>,
}

impl CommandStats {
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "Pages           [total]                  {}\n",
            self.total_pages
        ));
        let resources_total: usize = self.resources_per_page.iter().sum();
        out.push_str(&format!(
            "Resources       [total]                  {}\n",
            resources_total
        ));

        if !self.resources_per_page.is_empty() {
            let mut sorted = self.resources_per_page.clone();
            sorted.sort_unstable();
            out.push_str(&format!(
                "Resources/Page  [min, mean, max]         {}, {}, {}\n",
                sorted[0],
                resources_total / sorted.len(),
                sorted[sorted.len() - 1]
            ));
        }

        out.push_str(&format!(
            "Duration        [total]                  {}\n",
            fmt_duration_human(self.total_duration)
        ));

        if !self.request_durations.is_empty() {
            let stats = calculate_duration_statistics(&self.request_durations);
            out.push_str(&format!(
                "Requ. Latencies [mean, 50, 95, 99, max]  {}\n",
                stats.summary_row()
            ));
        }
        if !self.processing_durations.is_empty() {
            let stats = calculate_duration_statistics(&self.processing_durations);
            out.push_str(&format!(
                "Proc. Latencies [mean, 50, 95, 99, max]  {}\n",
                stats.summary_row()
            ));
        }

        let total_requests = self.request_durations.len().max(1);
        out.push_str(&format!(
            "Bytes In        [total, mean]            {}, {}\n",
            fmt_bytes_human(self.total_bytes_in as f64),
            fmt_bytes_human(self.total_bytes_in as f64 / total_requests as f64)
        ));

        if !self.inline_outcomes.is_empty() {
            out.push_str("\nServer Warnings & Information:\n");
            let outcomes: Vec<&OperationOutcome> = self.inline_outcomes.iter().collect();
            out.push_str(&indent(2, &fmt_operation_outcomes(&outcomes)));
        }

        if let Some(error) = &self.error {
            out.push_str("\nServer Error:\n");
            out.push_str(&indent(2, &fmt_error_response(error)));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn test_next_from_link_header() {
        assert_eq!(
            Some("http://localhost/fhir?page=2".to_string()),
            next_from_link_header(r#"<http://localhost/fhir?page=2>;rel="next""#)
        );
        assert_eq!(
            Some("http://localhost/fhir?page=2".to_string()),
            next_from_link_header(
                r#"<http://localhost/fhir?page=1>; rel="self", <http://localhost/fhir?page=2>; rel="next""#
            )
        );
        // Unquoted relation type and extra parameters.
        assert_eq!(
            Some("http://localhost/p2".to_string()),
            next_from_link_header(r#"<http://localhost/p2>; title="x"; rel=next"#)
        );
        // Commas inside the target must not split entries.
        assert_eq!(
            Some("http://localhost/fhir?_count=10,20".to_string()),
            next_from_link_header(r#"<http://localhost/fhir?_count=10,20>; rel="next""#)
        );
        assert_eq!(
            None,
            next_from_link_header(r#"<http://localhost/fhir?page=1>; rel="self""#)
        );
    }

    #[test]
    fn test_next_link_prefers_header_over_body() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Link",
            HeaderValue::from_static(r#"<http://localhost/from-header>; rel="next""#),
        );
        let body = br#"{"link": [{"relation": "next", "url": "http://localhost/from-body"}]}"#;
        assert_eq!(
            Some("http://localhost/from-header".to_string()),
            next_link(&headers, body).unwrap()
        );
    }

    #[test]
    fn test_next_link_falls_back_to_body() {
        let headers = HeaderMap::new();
        let body = br#"{"link": [
            {"relation": "self", "url": "http://localhost/fhir?page=1"},
            {"relation": "next", "url": "http://localhost/fhir?page=2"}
        ]}"#;
        assert_eq!(
            Some("http://localhost/fhir?page=2".to_string()),
            next_link(&headers, body).unwrap()
        );
    }

    #[test]
    fn test_next_link_absent_terminates() {
        let headers = HeaderMap::new();
        assert_eq!(None, next_link(&headers, br#"{"link": []}"#).unwrap());
        assert_eq!(None, next_link(&headers, br#"{}"#).unwrap());
    }

    #[test]
    fn test_next_link_rejects_unparseable_url() {
        let headers = HeaderMap::new();
        let body = br#"{"link": [{"relation": "next", "url": "::not a url::"}]}"#;
        assert!(next_link(&headers, body).is_err());
    }

    #[test]
    fn test_write_resources() {
        let body = br#"{"entry": [
            {"resource": {"resourceType": "Patient", "id": "0"}, "search": {"mode": "match"}},
            {"resource": {
                "resourceType": "OperationOutcome",
                "issue": [{"severity": "warning", "code": "too-costly"}]
            }, "search": {"mode": "outcome"}},
            {"search": {"mode": "match"}},
            {"resource": {"resourceType": "Patient", "id": "1"}}
        ]}"#;

        let mut sink = Vec::new();
        let (resources, outcomes) = write_resources(body, &mut sink).unwrap();

        assert_eq!(2, resources);
        assert_eq!(1, outcomes.len());
        assert_eq!("too-costly", outcomes[0].issue[0].code);

        let lines: Vec<&str> = std::str::from_utf8(&sink).unwrap().lines().collect();
        assert_eq!(2, lines.len());
        assert_eq!(r#"{"resourceType":"Patient","id":"0"}"#, lines[0]);
        assert_eq!(r#"{"resourceType":"Patient","id":"1"}"#, lines[1]);

        // Each written line parses back to the original resource.
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!("Patient", value["resourceType"]);
        }
    }

    #[test]
    fn test_write_resources_empty_page() {
        let mut sink = Vec::new();
        let (resources, outcomes) = write_resources(br#"{}"#, &mut sink).unwrap();
        assert_eq!(0, resources);
        assert!(outcomes.is_empty());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_command_stats_render() {
        let stats = CommandStats {
            total_pages: 2,
            resources_per_page: vec![10, 4],
            request_durations: vec![0.2, 0.3],
            processing_durations: vec![0.1, 0.2],
            total_bytes_in: 4096,
            total_duration: Duration::from_millis(1500),
            inline_outcomes: Vec::new(),
            error: None,
        };
        let rendered = stats.render();
        assert!(rendered.contains("Pages           [total]                  2"));
        assert!(rendered.contains("Resources       [total]                  14"));
        assert!(rendered.contains("Resources/Page  [min, mean, max]         4, 7, 10"));
        assert!(rendered.contains("Bytes In        [total, mean]            4.00 KiB, 2.00 KiB"));
    }
}
