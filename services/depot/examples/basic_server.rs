//! Basic registry server example
//!
//! Run with: cargo run -p depot --example basic_server
//!
//! Then push an image: `docker push 127.0.0.1:5000/library/alpine:latest`

use depot::RegistryBuilder;
use storage::MemoryStorage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let storage = MemoryStorage::with_buckets(&["registry"]);

    let app = RegistryBuilder::new()
        .storage(storage.into())
        .bucket("registry")
        .max_upload_size(512 * 1024 * 1024)
        .build()
        .await?;

    let addr = "127.0.0.1:5000";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Registry listening on http://{}", addr);
    tracing::info!("Try: curl http://{}/v2/_catalog", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
