use anyhow::Result;
use clap::Args;
use std::sync::Arc;

use super::utils;
use super::GlobalArgs;

#[derive(Args)]
#[command(about = "Download history in NDJSON format")]
#[command(long_about = "Downloads history, extracts the resources from the returned
bundles and outputs one resource per line in NDJSON format.

If the optional resource-type and resource-id are given, the
corresponding instance-level history will be downloaded.

If only the optional resource-type is given, the corresponding
type-level history will be downloaded.

If resource-type and -id are omitted, the system-level history will be
used and all resources of the whole system will be downloaded.

Examples:
  blazectl download-history --server http://localhost:8080/fhir Patient DFRE25Q627JVEWOS > patient-history.ndjson
  blazectl download-history --server http://localhost:8080/fhir Patient > patients-history.ndjson
  blazectl download-history --server http://localhost:8080/fhir > system-history.ndjson")]
pub struct DownloadHistoryCommand {
    /// Resource type of the history
    pub resource_type: Option<String>,

    /// Resource id for an instance-level history
    pub resource_id: Option<String>,

    /// Write to file instead of stdout
    #[arg(short, long, value_name = "PATH")]
    pub output_file: Option<String>,
}

pub fn run(cmd: DownloadHistoryCommand, globals: &GlobalArgs) -> Result<()> {
    let client = Arc::new(utils::create_client(globals)?);

    tokio::runtime::Runtime::new()?.block_on(async {
        let initial = match (&cmd.resource_type, &cmd.resource_id) {
            (Some(resource_type), Some(id)) => client.history_instance_request(resource_type, id),
            (Some(resource_type), None) => client.history_type_request(resource_type),
            _ => client.history_system_request(),
        };

        let mut sink = utils::open_sink(cmd.output_file.as_deref());
        let stats = utils::download_pages(Arc::clone(&client), initial, &mut sink).await;

        eprint!("{}", stats.render());
        Ok(())
    })
}
