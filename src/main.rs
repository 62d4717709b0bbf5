//! Cliparr entry point.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cliparr::init_tracing();
    cliparr::run().await
}
