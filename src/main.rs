use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use discplay::config::Args;
use discplay::console::{self, ConsoleButtons};
use discplay::player::{DriveInfo, Monitor, Playback, PlayerState};
use discplay::settings::JsonSettings;
use discplay::sink::{BLOCK_FRAMES, PacedSink, QUEUE_DEPTH};
use discplay::usb::hotplug;
use discplay::usb::slot::DriveSlot;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.player_config();
    info!(settings = %args.settings.display(), "starting");

    let slot = DriveSlot::new();
    let (drive_tx, drive_rx) = watch::channel(DriveInfo::default());
    let (state_tx, state_rx) = watch::channel(PlayerState::default());

    let settings = JsonSettings::open(&args.settings).await;
    let (sink, _drain) =
        PacedSink::start(args.pcm_out.as_deref(), state_rx.clone(), BLOCK_FRAMES, QUEUE_DEPTH).await?;
    let buttons = ConsoleButtons::stdin(config.playback.long_press);

    tokio::spawn(hotplug::watch(slot.clone(), args.hotplug_poll()));
    tokio::spawn(Monitor::new(slot.clone(), drive_tx, config.monitor).run());
    tokio::spawn(console::report(drive_rx.clone(), state_rx, Duration::from_millis(250)));

    let playback = Playback::new(
        slot,
        drive_rx,
        state_tx,
        Box::new(sink),
        Box::new(buttons),
        Box::new(settings),
        config.playback,
    );
    playback.run().await;
    Ok(())
}
