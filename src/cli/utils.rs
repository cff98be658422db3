// Shared utility functions for CLI commands

use anyhow::{Context, Result};
use blazectl::client::{Auth, FhirClient};
use blazectl::download::{CommandStats, expand_pages, write_resources};
use std::fs::OpenOptions;
use std::io::{BufWriter, ErrorKind, Write};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::GlobalArgs;

/// Creates the FHIR client from the global flags.
pub fn create_client(globals: &GlobalArgs) -> Result<FhirClient> {
    let server = globals
        .server
        .as_deref()
        .context("missing required flag --server")?;

    let auth = if let Some(token) = &globals.token {
        Auth::Bearer {
            token: token.clone(),
        }
    } else if let Some(user) = &globals.user {
        Auth::Basic {
            user: user.clone(),
            password: globals.password.clone().unwrap_or_default(),
        }
    } else {
        Auth::None
    };

    if globals.insecure {
        FhirClient::new_insecure(server, auth)
    } else if let Some(ca_file) = &globals.certificate_authority {
        FhirClient::new_with_certificate_authority(server, auth, ca_file)
    } else {
        FhirClient::new(server, auth)
    }
}

/// Resolves a query argument: a leading `@` refers to a file whose trimmed
/// content is the query.
pub fn resolve_query(query: &str) -> Result<String> {
    match query.strip_prefix('@') {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("error while reading the query file {}", path))?;
            Ok(content.trim().to_string())
        }
        None => Ok(query.to_string()),
    }
}

/// Opens the download sink: the output file if one is given, stdout
/// otherwise. Creating the output file is non-destructive; if a file
/// already exists at the given path the command exits with code 3, on any
/// other error with code 4.
pub fn open_sink(output_file: Option<&str>) -> BufWriter<Box<dyn Write + Send>> {
    match output_file {
        Some(path) if !path.is_empty() => {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(file) => BufWriter::new(Box::new(file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    eprintln!("The output file {} does already exist.", path);
                    std::process::exit(3);
                }
                Err(err) => {
                    eprintln!("could not create the output file {}: {}", path, err);
                    std::process::exit(4);
                }
            }
        }
        _ => BufWriter::new(Box::new(std::io::stdout())),
    }
}

/// Streams all pages reachable from the initial request into the sink and
/// folds the command statistics.
///
/// A server error terminates the command with exit code 1 after printing
/// the partial statistics; a failure to write the sink terminates with
/// exit code 2.
pub async fn download_pages<W: Write>(
    client: Arc<FhirClient>,
    initial: reqwest::RequestBuilder,
    sink: &mut W,
) -> CommandStats {
    let started = Instant::now();
    let mut stats = CommandStats::default();

    let (page_tx, mut page_rx) = mpsc::channel(2);
    let streamer = tokio::spawn({
        let client = Arc::clone(&client);
        async move { expand_pages(&client, initial, page_tx).await }
    });

    while let Some(page) = page_rx.recv().await {
        stats.total_pages += 1;

        if page.error.is_some() || page.error_response.is_some() {
            if let Some(message) = &page.error {
                eprintln!("Failed to download resources: {}", message);
            }
            stats.error = page.error_response;
            stats.total_duration = started.elapsed();
            eprint!("{}", stats.render());
            std::process::exit(1);
        }

        if let Some(page_stats) = &page.stats {
            stats.request_durations.push(page_stats.request_duration);
            stats.processing_durations.push(page_stats.processing_duration);
            stats.total_bytes_in += page_stats.bytes_in;
        }

        match write_resources(&page.body, sink) {
            Ok((resources, outcomes)) => {
                stats.resources_per_page.push(resources);
                stats.inline_outcomes.extend(outcomes);
            }
            Err(err) => {
                eprintln!(
                    "Failed to write downloaded resources received from request to URL {}: {:#}",
                    page.url, err
                );
                let code = if err.downcast_ref::<std::io::Error>().is_some() { 2 } else { 1 };
                std::process::exit(code);
            }
        }
    }

    let _ = streamer.await;

    if let Err(err) = sink.flush() {
        eprintln!("Failed to write the downloaded resources: {}", err);
        std::process::exit(2);
    }

    stats.total_duration = started.elapsed();
    stats
}
