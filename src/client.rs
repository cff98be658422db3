//! FHIR HTTP client: base-URL joining, authentication, TLS configuration,
//! request constructors for each interaction, timed dispatch, and the
//! polling loop for asynchronous operations.

use anyhow::{Context, Result, anyhow, bail};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use reqwest::{Method, RequestBuilder, StatusCode};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::constants;
use crate::fhir::{Bundle, ErrorResponse, OperationOutcome, Parameters, is_transient_issue_code};
use crate::stats;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Authentication used in order to communicate with the FHIR server.
#[derive(Debug, Clone, Default)]
pub enum Auth {
    #[default]
    None,
    Basic {
        user: String,
        password: String,
    },
    Bearer {
        token: String,
    },
}

/// A FHIR client combining an HTTP client with the base URL of a FHIR
/// server. The base URL is normalised so that joining relative segments
/// neither produces `//` nor drops a server-side context path.
pub struct FhirClient {
    http: reqwest::Client,
    base_url: String,
    auth: Auth,
}

impl FhirClient {
    /// Creates a new client using the system trust store.
    pub fn new(base_url: &str, auth: Auth) -> Result<Self> {
        create_client(base_url, auth, false, None)
    }

    /// Creates a new client that accepts any server certificate. Use with
    /// great caution as it opens up man-in-the-middle attacks.
    pub fn new_insecure(base_url: &str, auth: Auth) -> Result<Self> {
        create_client(base_url, auth, true, None)
    }

    /// Creates a new client trusting only the certificate authority from the
    /// given PEM file.
    pub fn new_with_certificate_authority(
        base_url: &str,
        auth: Auth,
        ca_file: &Path,
    ) -> Result<Self> {
        create_client(base_url, auth, false, Some(ca_file))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds a request with authentication and the FHIR JSON Accept header
    /// applied. All request constructors go through here.
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self.http.request(method, url).header(ACCEPT, constants::FHIR_JSON);
        match &self.auth {
            Auth::None => req,
            Auth::Basic { user, password } => req.basic_auth(user, Some(password)),
            Auth::Bearer { token } => req.bearer_auth(token),
        }
    }

    /// Capabilities interaction: GET `{base}/metadata`.
    pub fn capabilities_request(&self) -> RequestBuilder {
        self.request(Method::GET, &format!("{}/metadata", self.base_url))
    }

    /// Transaction/batch interaction: POST against the base URL itself.
    pub fn transaction_request(&self, body: impl Into<reqwest::Body>) -> RequestBuilder {
        self.request(Method::POST, &self.base_url)
            .header(CONTENT_TYPE, constants::FHIR_JSON)
            .body(body)
    }

    /// Search type interaction using GET with the search query in the URL.
    /// The query is passed through as-is.
    pub fn search_type_request(&self, resource_type: &str, query: &str) -> RequestBuilder {
        let url = if query.is_empty() {
            format!("{}/{}", self.base_url, resource_type)
        } else {
            format!("{}/{}?{}", self.base_url, resource_type, query)
        };
        self.request(Method::GET, &url)
    }

    /// Search type interaction using POST with the search query in the body.
    pub fn post_search_type_request(&self, resource_type: &str, query: &str) -> RequestBuilder {
        self.request(
            Method::POST,
            &format!("{}/{}/_search", self.base_url, resource_type),
        )
        .header(CONTENT_TYPE, FORM_URLENCODED)
        .body(query.to_string())
    }

    /// Search system interaction using GET with the search query in the URL.
    pub fn search_system_request(&self, query: &str) -> RequestBuilder {
        let url = if query.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}?{}", self.base_url, query)
        };
        self.request(Method::GET, &url)
    }

    /// History instance interaction: GET `{base}/{type}/{id}/_history`.
    pub fn history_instance_request(&self, resource_type: &str, id: &str) -> RequestBuilder {
        self.request(
            Method::GET,
            &format!("{}/{}/{}/_history", self.base_url, resource_type, id),
        )
    }

    /// History type interaction: GET `{base}/{type}/_history`.
    pub fn history_type_request(&self, resource_type: &str) -> RequestBuilder {
        self.request(
            Method::GET,
            &format!("{}/{}/_history", self.base_url, resource_type),
        )
    }

    /// History system interaction: GET `{base}/_history`.
    pub fn history_system_request(&self) -> RequestBuilder {
        self.request(Method::GET, &format!("{}/_history", self.base_url))
    }

    /// Request based on a pagination link received from the server.
    pub fn paginated_request(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Type-level operation using GET with parameters in the query string.
    pub fn type_operation_request(
        &self,
        resource_type: &str,
        operation: &str,
        respond_async: bool,
        params: &[(&str, &str)],
    ) -> RequestBuilder {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        let url = format!(
            "{}/{}/${}?{}",
            self.base_url, resource_type, operation, query
        );
        let req = self.request(Method::GET, &url);
        if respond_async {
            req.header("Prefer", "respond-async")
        } else {
            req
        }
    }

    /// System-level operation using POST with a Parameters resource body.
    pub fn post_system_operation_request(
        &self,
        operation: &str,
        respond_async: bool,
        params: &Parameters,
    ) -> Result<RequestBuilder> {
        let body = serde_json::to_vec(params)?;
        let req = self
            .request(Method::POST, &format!("{}/${}", self.base_url, operation))
            .header(CONTENT_TYPE, constants::FHIR_JSON)
            .body(body);
        Ok(if respond_async {
            req.header("Prefer", "respond-async")
        } else {
            req
        })
    }

    /// Dispatches a request and reads the whole response body, capturing
    /// wire timing along the way.
    ///
    /// reqwest exposes no transport trace hooks, so headers-received stands
    /// in for the first response byte and dispatch start for connection
    /// acquisition; with a warm pooled connection the brackets coincide.
    pub async fn send_timed(&self, req: RequestBuilder) -> Result<TimedResponse> {
        self.execute_timed(req.build()?).await
    }

    /// Like `send_timed`, for an already built request.
    pub async fn execute_timed(&self, req: reqwest::Request) -> Result<TimedResponse> {
        let started = Instant::now();
        let mut resp = self.http.execute(req).await?;
        let processing_duration = started.elapsed().as_secs_f64();

        let status = resp.status();
        let headers = std::mem::take(resp.headers_mut());
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        let request_duration = started.elapsed().as_secs_f64();

        Ok(TimedResponse {
            status,
            headers,
            body,
            stats: RequestStats {
                request_duration,
                processing_duration,
            },
        })
    }

    /// Decodes a non-2xx response into an error: a structured
    /// OperationOutcomeError when the media type says the body is a FHIR
    /// error, the verbatim body otherwise.
    pub fn response_error(&self, resp: &TimedResponse) -> anyhow::Error {
        let decoded = ErrorResponse::from_response(
            resp.status.as_u16(),
            content_type(&resp.headers),
            &resp.body,
        );
        match decoded.outcome {
            Some(outcome) => anyhow::Error::new(OperationOutcomeError { outcome }),
            None => anyhow!(
                "unexpected response status {}: {}",
                resp.status,
                decoded.other.unwrap_or_default().trim_end()
            ),
        }
    }

    /// Polls the status endpoint of an asynchronous operation until it
    /// produces a result.
    ///
    /// Waits 100 ms before the first poll and doubles the wait on every
    /// `202 Accepted`, capped at 10 s. On `200 OK` the body has to be a
    /// `batch-response` Bundle with exactly one entry; an entry status
    /// beginning with `200` yields the raw resource payload, anything else
    /// the decoded outcome as an error. A signal on the interrupt channel
    /// issues a DELETE against the status endpoint and returns a
    /// cancellation error. Eclipsed time is reported on stderr.
    pub async fn poll_async_status(
        &self,
        location: &str,
        mut interrupt: watch::Receiver<bool>,
    ) -> Result<Vec<u8>> {
        let location = self.resolve_location(location)?;
        let started = Instant::now();
        let mut wait = Duration::from_millis(constants::POLL_INITIAL_WAIT_MS);
        let max_wait = Duration::from_secs(constants::POLL_MAX_WAIT_SECS);

        loop {
            if self.wait_or_cancel(wait, &mut interrupt).await? {
                self.cancel_async_request(&location).await?;
                bail!("cancelled the asynchronous request at {}", location);
            }

            eprintln!(
                "Poll status endpoint at {} ... ({} elapsed)",
                location,
                stats::fmt_duration_human(started.elapsed())
            );

            let resp = self.send_timed(self.request(Method::GET, &location)).await?;
            match resp.status {
                StatusCode::OK => return extract_async_result(&resp.body),
                StatusCode::ACCEPTED => {
                    // 202 body was drained by send_timed; keep polling.
                    wait = (wait * 2).min(max_wait);
                }
                _ => return Err(self.response_error(&resp)),
            }
        }
    }

    /// Sleeps for `wait`, returning early with `true` when the interrupt
    /// channel signals cancellation.
    async fn wait_or_cancel(
        &self,
        wait: Duration,
        interrupt: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(false),
            changed = interrupt.changed() => match changed {
                Ok(()) => Ok(*interrupt.borrow()),
                Err(_) => {
                    // Interrupt source is gone; just finish the wait.
                    tokio::time::sleep(wait).await;
                    Ok(false)
                }
            },
        }
    }

    async fn cancel_async_request(&self, location: &str) -> Result<()> {
        let resp = self.send_timed(self.request(Method::DELETE, location)).await?;
        log::debug!("cancellation request to {} answered {}", location, resp.status);
        Ok(())
    }

    /// Status locations may be handed out relative to the server; resolve
    /// them against the base URL.
    fn resolve_location(&self, location: &str) -> Result<String> {
        let base = reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("invalid server base URL: {}", self.base_url))?;
        Ok(base
            .join(location)
            .with_context(|| format!("invalid status endpoint location `{}`", location))?
            .to_string())
    }
}

fn create_client(
    base_url: &str,
    auth: Auth,
    insecure: bool,
    ca_file: Option<&Path>,
) -> Result<FhirClient> {
    let url = reqwest::Url::parse(base_url)
        .with_context(|| format!("invalid server base URL: {}", base_url))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("invalid server base URL: {}: scheme has to be http or https", base_url);
    }

    let mut builder = reqwest::Client::builder()
        .user_agent(constants::user_agent())
        .pool_max_idle_per_host(constants::MAX_CONNS_PER_HOST);

    if insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(path) = ca_file {
        let pem = std::fs::read(path).with_context(|| {
            format!(
                "error while reading the certificate authority file {}",
                path.display()
            )
        })?;
        let cert = reqwest::Certificate::from_pem(&pem).with_context(|| {
            format!(
                "error while parsing the certificate authority file {}",
                path.display()
            )
        })?;
        builder = builder
            .tls_built_in_root_certs(false)
            .add_root_certificate(cert);
    }

    Ok(FhirClient {
        http: builder.build()?,
        base_url: base_url.trim_end_matches('/').to_string(),
        auth,
    })
}

/// Wire timing of one request, in seconds: full dispatch-to-body-consumed
/// and dispatch-to-first-response-byte.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestStats {
    pub request_duration: f64,
    pub processing_duration: f64,
}

/// A fully read response together with its wire timing.
#[derive(Debug)]
pub struct TimedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub stats: RequestStats,
}

pub fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONTENT_TYPE)?.to_str().ok()
}

/// Extracts the `Content-Location` polling URL from a `202 Accepted`
/// response.
pub fn content_location(headers: &HeaderMap) -> Result<String> {
    headers
        .get("Content-Location")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .context("missing Content-Location header in async response")
}

/// Unwraps the single-entry `batch-response` Bundle convention of finished
/// asynchronous operations.
fn extract_async_result(body: &[u8]) -> Result<Vec<u8>> {
    let bundle: Bundle = serde_json::from_slice(body).context("non FHIR response")?;
    if bundle.bundle_type != "batch-response" {
        bail!(
            "expected a batch-response Bundle in the async response but was `{}`",
            bundle.bundle_type
        );
    }
    if bundle.entry.len() != 1 {
        bail!(
            "expected one entry in the async response Bundle but were {} entries",
            bundle.entry.len()
        );
    }

    let entry = bundle.entry.into_iter().next().unwrap();
    let response = entry
        .response
        .context("missing response in the async response Bundle entry")?;
    if response.status.starts_with("200") {
        // Operations without a result resource, like $compact, leave the
        // entry empty.
        return Ok(entry
            .resource
            .map(|resource| resource.get().as_bytes().to_vec())
            .unwrap_or_default());
    }

    match response.outcome {
        Some(raw) => {
            let outcome: OperationOutcome = serde_json::from_str(raw.get())
                .context("error while decoding the outcome of the async response")?;
            Err(anyhow::Error::new(OperationOutcomeError { outcome }))
        }
        None => bail!(
            "async response entry has status {} and carries no outcome",
            response.status
        ),
    }
}

/// An error carrying a decoded OperationOutcome.
#[derive(Debug)]
pub struct OperationOutcomeError {
    pub outcome: OperationOutcome,
}

impl OperationOutcomeError {
    /// Whether any issue code marks this error as worth retrying.
    pub fn is_transient(&self) -> bool {
        self.outcome
            .issue
            .iter()
            .any(|issue| is_transient_issue_code(&issue.code))
    }
}

impl fmt::Display for OperationOutcomeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(stats::fmt_operation_outcomes(&[&self.outcome]).trim_end())
    }
}

impl std::error::Error for OperationOutcomeError {}
