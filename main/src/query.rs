mod bootstrap;

use anyhow::bail;
use bootstrap::{init_tracing, Services};
use common::{utils::config::get_config, vector::TopK};
use retrieval_pipeline::RetrievalQuery;

/// `query <workspace_id> <question...>`: print the grouped sources as JSON.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let Some(workspace_id) = args.next() else {
        bail!("usage: query <workspace_id> <question...>");
    };
    let question = args.collect::<Vec<_>>().join(" ");

    let config = get_config()?;
    let services = Services::connect(config).await?;
    let retriever = services.retriever()?;

    let result = retriever
        .retrieve(&RetrievalQuery {
            top_k: TopK::Limit(8),
            ..RetrievalQuery::new(workspace_id, question)
        })
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
