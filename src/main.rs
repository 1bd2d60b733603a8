#[tokio::main]
async fn main() -> anyhow::Result<()> {
    probe_link_lib::run().await
}
