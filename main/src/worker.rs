mod bootstrap;

use bootstrap::{init_tracing, shutdown_on_ctrl_c, Services};
use common::utils::config::get_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = get_config()?;
    let services = Services::connect(config).await?;
    let scanner = services.scanner()?;

    scanner.run(shutdown_on_ctrl_c()).await?;
    Ok(())
}
