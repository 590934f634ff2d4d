#[tokio::main]
async fn main() {
    metergate::run().await;
}
