#[tokio::main]
async fn main() {
    if let Err(e) = glycowatch_lib::run().await {
        tracing::error!("Glycowatch failed: {e}");
        eprintln!("glycowatch: {e}");
        std::process::exit(1);
    }
}
