//! Controller process entry point.

use anyhow::Result;
use service_catalog_controller::runtime::{initialize, run_watch_loop};

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;
    run_watch_loop(init.client, init.context, init.server_state).await
}
