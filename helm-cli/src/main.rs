#[tokio::main]
async fn main() -> anyhow::Result<()> {
    helm_cli::run_app().await
}
