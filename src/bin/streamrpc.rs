#[async_std::main]
async fn main() -> anyhow::Result<()> {
    streamrpc::cli::main().await
}
