use anyhow::{Context, Result, bail};
use blazectl::measure::{
    create_library_resource, create_measure_resource, evaluate_measure_with_retry,
    evaluation_bundle, random_canonical_url, read_measure_file, submit_resources,
};
use clap::Args;
use std::path::PathBuf;
use tokio::sync::watch;

use super::utils;
use super::GlobalArgs;

#[derive(Args)]
#[command(about = "Evaluates a Measure")]
#[command(long_about = "Given a measure in YAML form, creates the required FHIR
resources, evaluates that measure and returns the measure report.

The server may choose to answer asynchronously; in that case the status
endpoint is polled until the report is ready. An interrupt cancels the
running evaluation on the server.

Example:
  blazectl evaluate-measure --server http://localhost:8080/fhir stratifier-condition-code.yml")]
pub struct EvaluateMeasureCommand {
    /// YAML file with the measure specification
    pub measure_file: PathBuf,

    /// Force synchronous responses
    #[arg(long)]
    pub force_sync: bool,
}

pub fn run(cmd: EvaluateMeasureCommand, globals: &GlobalArgs) -> Result<()> {
    match std::fs::metadata(&cmd.measure_file) {
        Err(_) => bail!("measure file `{}` doesn't exist", cmd.measure_file.display()),
        Ok(meta) if meta.is_dir() => bail!("`{}` is a directory", cmd.measure_file.display()),
        Ok(_) => {}
    }

    let measure_spec = read_measure_file(&cmd.measure_file)?;

    let measure_url = random_canonical_url();
    let library_url = random_canonical_url();

    let measure = create_measure_resource(&measure_spec, &measure_url, &library_url)
        .context("error while reading the measure file")?;
    let library = create_library_resource(&measure_spec, &library_url)?;
    let bundle = evaluation_bundle(&measure, &library)?;

    let client = utils::create_client(globals)?;

    tokio::runtime::Runtime::new()?.block_on(async {
        submit_resources(&client, &bundle).await?;

        eprintln!(
            "Evaluate measure with canonical URL {} on {} ...\n",
            measure_url,
            client.base_url()
        );

        let (interrupt_tx, interrupt_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = interrupt_tx.send(true);
            }
        });

        let report =
            evaluate_measure_with_retry(&client, &measure_url, cmd.force_sync, interrupt_rx)
                .await
                .with_context(|| {
                    format!(
                        "error while evaluating the measure with canonical URL {}",
                        measure_url
                    )
                })?;

        println!("{}", String::from_utf8_lossy(&report));
        Ok(())
    })
}
