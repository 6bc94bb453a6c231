use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use ecoflow_ble::{
    Advertisement, BluestTransport, ControllerConfig, Coordinator, DeviceInfo, EcoflowController,
    HostState, MANUFACTURER_ID,
};
use futures_util::{Stream, StreamExt};
use log::info;
use tokio::time::timeout;

/// Watch an EcoFlow power station and print its state whenever it changes
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address of the power station. When omitted the first EcoFlow device seen is used.
    address: Option<String>,

    /// JSON file with timing and retry settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON file with a previously stored device record
    #[arg(long, requires = "address")]
    state: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("reading config from {}", path.display()))?,
        None => ControllerConfig::default(),
    };

    let transport = Arc::new(BluestTransport::new().await?);
    let mut advertisements = transport.advertisements().await?;

    let controller = match (&args.state, &args.address) {
        (Some(path), Some(address)) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading device record from {}", path.display()))?;
            let state: DeviceInfo = serde_json::from_str(&text)?;
            EcoflowController::from_state(transport.clone(), address.clone(), state, config)
        }
        (_, address) => {
            let first = timeout(
                config.startup_timeout(),
                discover_device(&mut advertisements, address.as_deref()),
            )
            .await
            .map_err(|_| anyhow!("Device not found"))??;
            EcoflowController::from_advertisement(transport.clone(), &first, config)?
        }
    };
    info!("Tracking {} at {}", controller.name(), controller.address());

    let _unregister = controller.register_callback(|info, change| {
        println!("{change:?}: {} ({}) battery {:?}%", info.name, info.model(), info.battery);
    });

    let coordinator = Coordinator::new(controller.clone());
    let run = coordinator.run(advertisements);
    tokio::pin!(run);

    tokio::select! {
        ready = coordinator.wait_ready() => {
            if !ready {
                bail!("{} is not advertising state", controller.address());
            }
        }
        _ = &mut run => bail!("Advertisement stream ended"),
    }
    coordinator.set_host_state(HostState::Running);
    info!("{} ready: {:?}", controller.address(), controller.state());

    tokio::select! {
        _ = &mut run => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    coordinator.set_host_state(HostState::Stopping);
    controller.stop().await;
    Ok(())
}

/// Wait for an EcoFlow advertisement, from `address` if given
async fn discover_device<S>(advertisements: &mut S, address: Option<&str>) -> anyhow::Result<Advertisement>
where
    S: Stream<Item = Advertisement> + Unpin,
{
    while let Some(advertisement) = advertisements.next().await {
        let wanted = address.map_or(true, |address| advertisement.address == address);
        if wanted && advertisement.manufacturer_data.contains_key(&MANUFACTURER_ID) {
            info!(
                "Found {} at {}, RSSI {:?}",
                advertisement.local_name.as_deref().unwrap_or("unnamed device"),
                advertisement.address,
                advertisement.rssi
            );
            return Ok(advertisement);
        }
    }

    Err(anyhow!("Device not found"))
}
