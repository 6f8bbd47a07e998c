use anyhow::{Context as _, Result};

use super::Context;

pub async fn run_status(ctx: &Context, task_id: &str) -> Result<()> {
    let task = ctx.client()?.get_task(task_id).await?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

pub async fn run_health(ctx: &Context) -> Result<()> {
    let client = ctx.client()?;
    let health = client
        .check_health()
        .await
        .with_context(|| format!("Bridge Server at {} is not reachable", client.base_url()))?;
    println!("Bridge Server at {} is {}", client.base_url(), health.status);
    println!("  Uptime: {}s", health.uptime_seconds);
    Ok(())
}
