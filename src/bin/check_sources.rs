//! Fetch both sources once and print what the adapters see.
//!
//! Useful when a platform changes its page or API shape.

use anyhow::Result;
use onair::config;
use onair::integrations;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = config::load(config_path.as_deref())?;
    let sources = integrations::sources_from_config(&config);

    for (platform, source) in sources.iter() {
        println!("=== {} ===", platform);
        match source.fetch().await {
            Ok(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
            Err(e) => println!("Fetch failed: {:#}", e),
        }
        println!();
    }

    Ok(())
}
