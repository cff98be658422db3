use anyhow::Result;
use blazectl::count::{count_resources, render_counts};
use clap::Args;

use super::utils;
use super::GlobalArgs;

#[derive(Args)]
#[command(about = "Counts all resources by type")]
#[command(long_about = "Uses the capability statement to detect all resource types
supported on the server and counts the resources of every type with a
single batched search using _summary=count.")]
pub struct CountResourcesCommand {}

pub fn run(_cmd: CountResourcesCommand, globals: &GlobalArgs) -> Result<()> {
    let client = utils::create_client(globals)?;

    tokio::runtime::Runtime::new()?.block_on(async {
        let counts = count_resources(&client).await?;
        print!("{}", render_counts(&counts));
        Ok(())
    })
}
