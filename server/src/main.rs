#[tokio::main]
async fn main() {
    if let Err(err) = pagebot_server::app::run().await {
        tracing::error!(error = %err, "server failed");
        std::process::exit(1);
    }
}
