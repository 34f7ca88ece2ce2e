//! `colony chimera` -- create a Chimera workflow task.

use anyhow::Result;

use colony_core::Client;

pub async fn run(
    client: &Client,
    feature: &str,
    target_url: &str,
    staging_url: Option<&str>,
    priority: i64,
) -> Result<()> {
    let id = client
        .create_chimera_task(feature, target_url, staging_url, priority)
        .await?;
    println!("{id}");
    println!("Execute it with a populated agent registry via execute_workflow.");
    Ok(())
}
