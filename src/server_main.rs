use anyhow::Result;

use audio_browser::app::serve;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    serve().await
}
