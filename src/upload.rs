//! Concurrent bundle upload: a semaphore-gated worker pool feeding a result
//! channel, payload readers for the supported file formats, and the single
//! consumer that folds results into the final summary.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use crate::client::{FhirClient, content_type};
use crate::discovery::{BundleIdentifier, DiscoveredBundle, FileKind};
use crate::fhir::ErrorResponse;
use crate::stats::{
    calculate_duration_statistics, fmt_bytes_human, fmt_duration_human, fmt_error_response, indent,
};

/// Observer for upload progress. The sample handed to `increment` is the
/// bundle's wall time normalised by concurrency, which keeps moving-average
/// ETA estimates from jittering with the pool width.
pub trait UploadProgress: Send + Sync {
    fn increment(&self, sample: Duration);
    fn finish(&self);
}

/// Observer used when progress output is suppressed.
pub struct NoProgress;

impl UploadProgress for NoProgress {
    fn increment(&self, _sample: Duration) {}
    fn finish(&self) {}
}

/// Outcome of one HTTP upload attempt.
#[derive(Debug)]
pub struct UploadInfo {
    pub status: u16,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub request_duration: f64,
    pub processing_duration: f64,
    pub content_type: Option<String>,
    /// Raw response body, kept for structured decoding when status ≠ 200.
    pub error_body: Option<Vec<u8>>,
}

/// Result of uploading one bundle: its identity plus either the HTTP outcome
/// or the error that prevented the attempt.
#[derive(Debug)]
pub struct BundleUploadResult {
    pub id: BundleIdentifier,
    pub result: Result<UploadInfo>,
}

/// Aggregate over a whole upload run.
#[derive(Debug)]
pub struct UploadSummary {
    pub total: usize,
    pub concurrency: usize,
    pub request_durations: Vec<f64>,
    pub processing_durations: Vec<f64>,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub error_responses: BTreeMap<BundleIdentifier, ErrorResponse>,
    pub errors: BTreeMap<BundleIdentifier, String>,
    pub total_duration: Duration,
}

impl UploadSummary {
    fn new(concurrency: usize) -> Self {
        Self {
            total: 0,
            concurrency,
            request_durations: Vec::new(),
            processing_durations: Vec::new(),
            total_bytes_in: 0,
            total_bytes_out: 0,
            error_responses: BTreeMap::new(),
            errors: BTreeMap::new(),
            total_duration: Duration::ZERO,
        }
    }

    pub fn successes(&self) -> usize {
        self.request_durations.len()
    }

    pub fn failures(&self) -> usize {
        self.error_responses.len() + self.errors.len()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "Uploads         [total, concurrency]     {}, {}\n",
            self.total, self.concurrency
        ));
        let ratio = if self.total > 0 {
            (self.total - self.failures()) as f64 / self.total as f64 * 100.0
        } else {
            100.0
        };
        out.push_str(&format!("Success         [ratio]                  {:.2} %\n", ratio));
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

        let transfers = self.successes() + self.error_responses.len();
        let mean = |total: u64| {
            if transfers > 0 {
                fmt_bytes_human(total as f64 / transfers as f64)
            } else {
                fmt_bytes_human(0.0)
            }
        };
        out.push_str(&format!(
            "Bytes In        [total, mean]            {}, {}\n",
            fmt_bytes_human(self.total_bytes_in as f64),
            mean(self.total_bytes_in)
        ));
        out.push_str(&format!(
            "Bytes Out       [total, mean]            {}, {}\n",
            fmt_bytes_human(self.total_bytes_out as f64),
            mean(self.total_bytes_out)
        ));

        let mut status_codes = vec![format!("200:{}", self.successes())];
        let mut error_frequencies: BTreeMap<u16, usize> = BTreeMap::new();
        for response in self.error_responses.values() {
            *error_frequencies.entry(response.status).or_default() += 1;
        }
        for (status, count) in &error_frequencies {
            status_codes.push(format!("{}:{}", status, count));
        }
        out.push_str(&format!(
            "Status Codes    [code:count]             {}\n",
            status_codes.join(", ")
        ));

        if !self.error_responses.is_empty() {
            out.push_str("\nNon-OK Responses:\n");
            for (id, response) in &self.error_responses {
                out.push_str(&format!("{} :\n", id));
                out.push_str(&indent(2, &fmt_error_response(response)));
            }
        }
        if !self.errors.is_empty() {
            out.push_str("\nErrors:\n");
            for (id, error) in &self.errors {
                out.push_str(&format!("{} : {}\n", id, error));
            }
        }

        out
    }
}

/// Uploads all discovered bundles with at most `concurrency` requests in
/// flight and returns the folded summary. Bundles are dispatched in
/// enumeration order, or reversed when `reverse` is set; results arrive in
/// completion order. Every discovered bundle ends up in the summary.
pub async fn upload_bundles(
    client: Arc<FhirClient>,
    bundles: Vec<DiscoveredBundle>,
    concurrency: usize,
    reverse: bool,
    progress: Arc<dyn UploadProgress>,
) -> Result<UploadSummary> {
    let started = Instant::now();
    let (result_tx, result_rx) = mpsc::channel::<BundleUploadResult>(concurrency.max(1) * 2);
    let aggregator = tokio::spawn(aggregate(result_rx, concurrency));

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut workers = JoinSet::new();

    let ordered: Box<dyn Iterator<Item = DiscoveredBundle> + Send> = if reverse {
        Box::new(bundles.into_iter().rev())
    } else {
        Box::new(bundles.into_iter())
    };

    for bundle in ordered {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("upload semaphore closed")?;
        let client = Arc::clone(&client);
        let result_tx = result_tx.clone();
        let progress = Arc::clone(&progress);

        workers.spawn(async move {
            let bundle_started = Instant::now();
            let result = match bundle.error {
                Some(error) => Err(error),
                None => upload_one(&client, &bundle.id, bundle.kind).await,
            };
            drop(permit);

            let sample = bundle_started.elapsed() / concurrency.max(1) as u32;
            progress.increment(sample);

            let _ = result_tx
                .send(BundleUploadResult {
                    id: bundle.id,
                    result,
                })
                .await;
        });
    }
    drop(result_tx);

    while let Some(joined) = workers.join_next().await {
        joined.context("upload worker panicked")?;
    }
    progress.finish();

    let mut summary = aggregator.await.context("upload aggregator panicked")?;
    summary.total_duration = started.elapsed();
    Ok(summary)
}

/// Uploads one bundle: reads the payload off the worker thread pool, POSTs
/// it as a transaction, and drains the response.
async fn upload_one(
    client: &FhirClient,
    id: &BundleIdentifier,
    kind: FileKind,
) -> Result<UploadInfo> {
    let reader_id = id.clone();
    let payload = tokio::task::spawn_blocking(move || read_payload(&reader_id, kind))
        .await
        .context("payload reader task failed")??;
    let bytes_out = payload.len() as u64;

    let resp = client.send_timed(client.transaction_request(payload)).await?;

    let status = resp.status.as_u16();
    Ok(UploadInfo {
        status,
        bytes_out,
        bytes_in: resp.body.len() as u64,
        request_duration: resp.stats.request_duration,
        processing_duration: resp.stats.processing_duration,
        content_type: content_type(&resp.headers).map(str::to_string),
        error_body: (status != 200).then_some(resp.body),
    })
}

/// Reads the payload of one bundle. Compressed files are decompressed so the
/// byte count reflects what the server actually receives.
fn read_payload(id: &BundleIdentifier, kind: FileKind) -> Result<Vec<u8>> {
    let mut file = File::open(&id.path)
        .with_context(|| format!("error while opening {}", id.path.display()))?;
    let mut payload = Vec::new();

    match kind {
        FileKind::Json => {
            file.take(id.end - id.start).read_to_end(&mut payload)?;
        }
        FileKind::JsonGz => {
            flate2::read::GzDecoder::new(file).read_to_end(&mut payload)?;
        }
        FileKind::JsonBz2 => {
            bzip2::read::BzDecoder::new(file).read_to_end(&mut payload)?;
        }
        FileKind::Ndjson => {
            file.seek(SeekFrom::Start(id.start))?;
            file.take(id.end - id.start).read_to_end(&mut payload)?;
        }
    }

    Ok(payload)
}

/// Single consumer of the result channel. Exits when the channel closes and
/// returns the aggregate.
async fn aggregate(
    mut results: mpsc::Receiver<BundleUploadResult>,
    concurrency: usize,
) -> UploadSummary {
    let mut summary = UploadSummary::new(concurrency);

    while let Some(result) = results.recv().await {
        summary.total += 1;
        match result.result {
            Ok(info) if info.status == 200 => {
                summary.request_durations.push(info.request_duration);
                summary.processing_durations.push(info.processing_duration);
                summary.total_bytes_in += info.bytes_in;
                summary.total_bytes_out += info.bytes_out;
            }
            Ok(info) => {
                summary.total_bytes_in += info.bytes_in;
                summary.total_bytes_out += info.bytes_out;
                let response = ErrorResponse::from_response(
                    info.status,
                    info.content_type.as_deref(),
                    info.error_body.as_deref().unwrap_or_default(),
                );
                summary.error_responses.insert(result.id, response);
            }
            Err(error) => {
                summary.errors.insert(result.id, format!("{:#}", error));
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn identifier(path: std::path::PathBuf, index: u32, start: u64, end: u64) -> BundleIdentifier {
        BundleIdentifier { path, index, start, end }
    }

    #[test]
    fn test_read_payload_plain_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        std::fs::write(&path, b"{\"resourceType\": \"Bundle\"}").unwrap();
        let payload = read_payload(&identifier(path, 1, 0, 26), FileKind::Json).unwrap();
        assert_eq!(b"{\"resourceType\": \"Bundle\"}".as_slice(), payload);
    }

    #[test]
    fn test_read_payload_gzip_counts_decompressed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json.gz");
        let file = File::create(&path).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(b"{\"resourceType\": \"Bundle\", \"type\": \"transaction\"}").unwrap();
        encoder.finish().unwrap();

        let size = std::fs::metadata(&path).unwrap().len();
        let payload = read_payload(&identifier(path, 1, 0, size), FileKind::JsonGz).unwrap();
        assert_eq!(b"{\"resourceType\": \"Bundle\", \"type\": \"transaction\"}".as_slice(), payload);
    }

    #[test]
    fn test_read_payload_bzip2() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json.bz2");
        let file = File::create(&path).unwrap();
        let mut encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
        encoder.write_all(b"{\"resourceType\": \"Bundle\"}").unwrap();
        encoder.finish().unwrap();

        let size = std::fs::metadata(&path).unwrap().len();
        let payload = read_payload(&identifier(path, 1, 0, size), FileKind::JsonBz2).unwrap();
        assert_eq!(b"{\"resourceType\": \"Bundle\"}".as_slice(), payload);
    }

    #[test]
    fn test_read_payload_ndjson_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundles.ndjson");
        std::fs::write(&path, b"{\"a\": 1}\n{\"b\": 2}\n").unwrap();
        let payload = read_payload(&identifier(path, 2, 9, 17), FileKind::Ndjson).unwrap();
        assert_eq!(b"{\"b\": 2}".as_slice(), payload);
    }

    #[tokio::test]
    async fn test_aggregate_accounts_for_every_result() {
        let (tx, rx) = mpsc::channel(8);
        let aggregator = tokio::spawn(aggregate(rx, 2));

        let ok = |status: u16| UploadInfo {
            status,
            bytes_out: 100,
            bytes_in: 10,
            request_duration: 0.2,
            processing_duration: 0.1,
            content_type: Some("application/fhir+json".to_string()),
            error_body: (status != 200).then(|| {
                br#"{"resourceType": "OperationOutcome",
                    "issue": [{"severity": "error", "code": "timeout"}]}"#
                    .to_vec()
            }),
        };

        let path = std::path::PathBuf::from("bundles.ndjson");
        for index in 1..=2 {
            tx.send(BundleUploadResult {
                id: identifier(path.clone(), index, 0, 0),
                result: Ok(ok(200)),
            })
            .await
            .unwrap();
        }
        tx.send(BundleUploadResult {
            id: identifier(path.clone(), 3, 0, 0),
            result: Ok(ok(503)),
        })
        .await
        .unwrap();
        tx.send(BundleUploadResult {
            id: identifier(path.clone(), 4, 0, 0),
            result: Err(anyhow::anyhow!("connection refused")),
        })
        .await
        .unwrap();
        drop(tx);

        let summary = aggregator.await.unwrap();
        assert_eq!(4, summary.total);
        assert_eq!(2, summary.successes());
        assert_eq!(2, summary.failures());
        assert_eq!(
            summary.total,
            summary.successes() + summary.error_responses.len() + summary.errors.len()
        );
        assert_eq!(300, summary.total_bytes_out);
        assert_eq!(30, summary.total_bytes_in);

        let response = summary.error_responses.values().next().unwrap();
        assert_eq!(503, response.status);
        assert_eq!("timeout", response.outcome.as_ref().unwrap().issue[0].code);
        assert!(summary.errors.values().next().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_summary_render() {
        let (tx, rx) = mpsc::channel(8);
        let aggregator = tokio::spawn(aggregate(rx, 2));
        tx.send(BundleUploadResult {
            id: identifier(std::path::PathBuf::from("a.json"), 1, 0, 0),
            result: Ok(UploadInfo {
                status: 200,
                bytes_out: 2048,
                bytes_in: 128,
                request_duration: 0.25,
                processing_duration: 0.2,
                content_type: None,
                error_body: None,
            }),
        })
        .await
        .unwrap();
        drop(tx);
        let summary = aggregator.await.unwrap();

        let rendered = summary.render();
        assert!(rendered.contains("Uploads         [total, concurrency]     1, 2"));
        assert!(rendered.contains("Success         [ratio]                  100.00 %"));
        assert!(rendered.contains("Status Codes    [code:count]             200:1"));
        assert!(rendered.contains("Bytes Out       [total, mean]            2.00 KiB, 2.00 KiB"));
        assert!(!rendered.contains("Non-OK Responses"));
        assert!(!rendered.contains("Errors:"));
    }
}
