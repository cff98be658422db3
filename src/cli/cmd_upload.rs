use anyhow::{Result, bail};
use blazectl::constants;
use blazectl::discovery::discover_bundles;
use blazectl::upload::{NoProgress, UploadProgress, upload_bundles};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

use super::progress::ProgressBar;
use super::utils;
use super::GlobalArgs;

#[derive(Args)]
#[command(about = "Upload transaction bundles")]
#[command(long_about = "Uploads transaction bundles found inside a directory.

Transaction bundles are discovered recursively: `.json`, `.json.gz` and
`.json.bz2` files hold one bundle each, `.ndjson` files one bundle per
line. The upload is parallel according to the --concurrency flag. An
upload statistic is printed after the upload.

Example:

  blazectl upload --server http://localhost:8080/fhir my/bundles")]
pub struct UploadCommand {
    /// Directory containing the transaction bundles
    pub directory: PathBuf,

    /// Number of parallel uploads
    #[arg(short, long, default_value_t = constants::DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Upload the bundles in reverse enumeration order
    #[arg(short, long)]
    pub reverse: bool,
}

pub fn run(cmd: UploadCommand, globals: &GlobalArgs) -> Result<()> {
    match std::fs::metadata(&cmd.directory) {
        Err(_) => bail!("directory `{}` doesn't exist", cmd.directory.display()),
        Ok(meta) if !meta.is_dir() => bail!("`{}` isn't a directory", cmd.directory.display()),
        Ok(_) => {}
    }

    let client = Arc::new(utils::create_client(globals)?);

    tokio::runtime::Runtime::new()?.block_on(async {
        let bundles = discover_bundles(&cmd.directory).await?;

        if !globals.quiet {
            println!("Starting Upload to {} ...", client.base_url());
        }

        let progress: Arc<dyn UploadProgress> = if globals.no_progress || globals.quiet {
            Arc::new(NoProgress)
        } else {
            Arc::new(ProgressBar::new(bundles.len()))
        };

        let summary =
            upload_bundles(client, bundles, cmd.concurrency.max(1), cmd.reverse, progress).await?;

        println!("{}", summary.render());

        if summary.failures() > 0 {
            std::process::exit(1);
        }
        Ok(())
    })
}
