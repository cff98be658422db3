use anyhow::Result;
use clap::Args;
use std::sync::Arc;

use super::utils;
use super::GlobalArgs;

#[derive(Args)]
#[command(about = "Download FHIR resources in NDJSON format")]
#[command(long_about = "Downloads FHIR resources, extracts them from the returned
search bundles and outputs one resource per line in NDJSON format.

With a resource type the type-level search is used; without one the
search runs at system level and downloads resources of all types.

Resources are either streamed to STDOUT, delimited by newline, or stored
in a file if the --output-file flag is given. Download statistics go to
STDERR.

Examples:
  blazectl download --server http://localhost:8080/fhir Patient -o patients.ndjson
  blazectl download --server http://localhost:8080/fhir Patient -q \"gender=female\" > patients.ndjson
  blazectl download --server http://localhost:8080/fhir -q \"_count=100\" > all.ndjson")]
pub struct DownloadCommand {
    /// Resource type to download; without it the system-level search is used
    pub resource_type: Option<String>,

    /// FHIR search query; @FILE reads the query from a file
    #[arg(short, long, value_name = "QUERY", default_value = "")]
    pub query: String,

    /// Use POST to execute the search
    #[arg(short = 'p', long)]
    pub use_post: bool,

    /// Write to file instead of stdout
    #[arg(short, long, value_name = "PATH")]
    pub output_file: Option<String>,
}

pub fn run(cmd: DownloadCommand, globals: &GlobalArgs) -> Result<()> {
    let client = Arc::new(utils::create_client(globals)?);
    let query = utils::resolve_query(&cmd.query)?;

    tokio::runtime::Runtime::new()?.block_on(async {
        // Next-page requests always use GET, also with --use-post.
        let initial = match &cmd.resource_type {
            Some(resource_type) if cmd.use_post => {
                client.post_search_type_request(resource_type, &query)
            }
            Some(resource_type) => client.search_type_request(resource_type, &query),
            None => client.search_system_request(&query),
        };

        let mut sink = utils::open_sink(cmd.output_file.as_deref());
        let stats = utils::download_pages(Arc::clone(&client), initial, &mut sink).await;

        eprint!("{}", stats.render());
        Ok(())
    })
}
