mod command;
mod config;
mod control;
mod crossfade;
mod encoder;
mod error;
mod health;
mod http;
mod io;
mod metrics;
mod orchestrator;
mod resolver;
mod runtime;
mod session;
mod slots;

use crate::config::AppConfig;
use crate::control::ControlPoller;
use crate::encoder::{FfmpegLauncher, Launcher};
use crate::orchestrator::Orchestrator;
use crate::resolver::{MemoryMappingStore, TrackResolver};
use crate::runtime::{Event, Runtime};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use log::{info, warn};
use loopcast_core::control::{Command, ControlChannel, FileControlChannel, StatusSnapshot};
use loopcast_core::models::Broadcast;
use pretty_env_logger::env_logger;
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use warp::Filter;

const EVENT_QUEUE: usize = 64;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let config: AppConfig = AppConfig::from_args();
    let broadcast_config = File::open(&config.broadcast_path)?;
    let broadcast: Broadcast = serde_json::from_reader(broadcast_config)?;
    broadcast.is_valid()?;
    info!(
        "Loaded broadcast {} in {} mode",
        broadcast.id.as_deref().unwrap_or("(unnamed)"),
        broadcast.mode
    );

    let store = match &broadcast.mappings_path {
        Some(path) => MemoryMappingStore::from_path(path)?,
        None => {
            warn!("No track mappings configured, every track plays the default loop");
            MemoryMappingStore::new(Vec::new())
        }
    };
    let resolver = TrackResolver::new(Box::new(store), broadcast.default_loop.clone());

    let launcher: Arc<dyn Launcher> = Arc::new(FfmpegLauncher);
    let control = broadcast.control.clone();
    let binder = slots::binder_for(
        &broadcast.slots,
        &broadcast.encoder,
        launcher.clone(),
        control.io_timeout(),
    );
    let channel: Arc<dyn ControlChannel> = Arc::new(FileControlChannel::open(&control.dir)?);

    let (events, receiver) = mpsc::channel(EVENT_QUEUE);
    let (stop_tx, stop_rx) = watch::channel(0u64);
    let (status_tx, status_rx) = watch::channel(StatusSnapshot::stopped(broadcast.mode));

    let orchestrator = Orchestrator::new(broadcast, resolver, launcher, binder, stop_rx)?;
    let health_interval = orchestrator.health_interval();

    info!("Watching control channel at {}", control.dir.display());
    let poller = ControlPoller::new(
        channel,
        events.clone(),
        stop_tx,
        status_rx.clone(),
        control.io_timeout(),
    );
    let poller = tokio::spawn(poller.run(
        Duration::from_millis(control.poll_interval_ms),
        Duration::from_millis(control.status_interval_ms),
    ));

    tokio::spawn(health_ticks(events.clone(), health_interval));

    let routes = http::routes(events.clone(), status_rx).with(warp::log("loopcast::http"));
    info!("Serving metrics and intake on port {}", config.http_port);
    tokio::spawn(warp::serve(routes).run(([0, 0, 0, 0], config.http_port)));

    let terminate = events.clone();
    ctrlc::set_handler(move || {
        if terminate.blocking_send(Event::Terminate).is_err() {
            warn!("Engine already stopped");
        }
    })?;

    if config.autostart {
        events
            .send(Event::Control(Command::Start))
            .await
            .map_err(|_| eyre!("Engine runtime is not accepting events"))?;
    }

    let mut runtime = Runtime::new(receiver, orchestrator, status_tx);
    info!("Starting engine runtime..");
    runtime.run().await;
    // Closing the queue lets the poller write the final status.
    drop(runtime);
    if let Err(err) = poller.await {
        warn!("Control poller ended abnormally: {}", err);
    }

    info!("Engine stopped");
    Ok(())
}

/// Feeds the runtime a health tick on every interval. A full queue means one is already waiting.
async fn health_ticks(events: mpsc::Sender<Event>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match events.try_send(Event::HealthTick) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => break,
        }
    }
}
