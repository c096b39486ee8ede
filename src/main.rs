#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use sip_agent::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    let mut agent = sip_agent::startup(config).await?;
    agent.init();

    // Event consumers (bell button feedback, relay actuator, UI) hang off
    // this bus; the binary itself only keeps it drained.
    if let Some(mut events) = agent.events() {
        while let Some(event) = events.recv().await {
            log::debug!("bus event: {event:?}");
        }
    }

    Ok(())
}
