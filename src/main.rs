#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cities_search::run().await
}
