#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chat_box_lib::run().await
}
