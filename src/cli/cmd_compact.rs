use anyhow::{Context, Result, bail};
use blazectl::client::content_location;
use blazectl::fhir::Parameters;
use clap::Args;
use tokio::sync::watch;

use super::utils;
use super::GlobalArgs;

const INDEX_COLUMN_FAMILIES: [&str; 16] = [
    "search-param-value-index",
    "resource-value-index",
    "compartment-search-param-value-index",
    "compartment-resource-type-index",
    "active-search-params",
    "tx-success-index",
    "tx-error-index",
    "t-by-instant-index",
    "resource-as-of-index",
    "type-as-of-index",
    "system-as-of-index",
    "patient-last-change-index",
    "type-stats-index",
    "system-stats-index",
    "cql-bloom-filter",
    "cql-bloom-filter-by-t",
];

#[derive(Args)]
#[command(about = "Compact a database column family")]
#[command(long_about = "Initiates compaction of a column family of a database.

The operation runs asynchronously on the server; the command polls the
status endpoint until the compaction finished.

Example:
  blazectl compact --server http://localhost:8080/fhir index search-param-value-index")]
pub struct CompactCommand {
    /// Database to compact (index, transaction or resource)
    pub database: String,

    /// Column family to compact
    pub column_family: String,
}

pub fn run(cmd: CompactCommand, globals: &GlobalArgs) -> Result<()> {
    match cmd.database.as_str() {
        "index" => {
            if !INDEX_COLUMN_FAMILIES.contains(&cmd.column_family.as_str()) {
                bail!(
                    "invalid column family. Must be one of: {}",
                    INDEX_COLUMN_FAMILIES.join(", ")
                );
            }
        }
        _ => {
            if cmd.column_family != "default" {
                bail!("invalid column family. Must be: default");
            }
        }
    }

    let client = utils::create_client(globals)?;

    tokio::runtime::Runtime::new()?.block_on(async {
        let params = Parameters::from_codes(&[
            ("database", cmd.database.as_str()),
            ("column-family", cmd.column_family.as_str()),
        ]);
        let req = client.post_system_operation_request("compact", true, &params)?;

        let resp = client.send_timed(req).await?;
        if resp.status.as_u16() != 202 {
            return Err(client.response_error(&resp))
                .context("error while compacting the column family");
        }
        let location = content_location(&resp.headers)?;

        let (interrupt_tx, interrupt_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = interrupt_tx.send(true);
            }
        });

        client
            .poll_async_status(&location, interrupt_rx)
            .await
            .context("error while compacting the column family")?;

        println!(
            "Successfully compacted column family `{}` in database `{}`.",
            cmd.column_family, cmd.database
        );
        Ok(())
    })
}
