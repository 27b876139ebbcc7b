//! Stemsync Player - synchronized playback of separated stems
//!
//! Loads every file given on the command line into one playback session and
//! plays them in lockstep until the longest stem ends or Ctrl-C is pressed.
//!
//! ## Command line flags
//!
//! - `--config <PATH>`: YAML config (default `~/.config/stemsync/config.yaml`)
//! - `--start-ms <MS>`: start position
//! - `--rate <RATE>`: playback rate (independent players only)
//! - `--volume NAME=LEVEL`: per-track volume 0-100, repeatable
//! - `--headless`: render into a paced in-memory output instead of a device
//! - `--list-devices`: print output devices and exit

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use stemsync_core::asset::{AssetCache, AssetLoader};
use stemsync_core::audio::{get_output_devices, CpalOutputProvider, HeadlessOutput, OutputProvider, Pacer};
use stemsync_core::clock::{Clock, MonotonicClock};
use stemsync_core::config::default_config_path;
use stemsync_core::engine::MixerEngine;
use stemsync_core::track::{LoadState, VolumeStore, YamlVolumeStore};
use stemsync_core::{PlaybackSession, SessionEvent, SessionServices, TrackId};

/// Scheduling loop period
const TICK_PERIOD: Duration = Duration::from_millis(50);
/// Progress is logged every this many ticks
const PROGRESS_EVERY: u32 = 20;

#[derive(Debug, Parser)]
#[command(name = "stemsync-player", version, about = "Play audio stems in sync")]
struct Args {
    /// Audio files to play together
    #[arg(required_unless_present = "list_devices")]
    files: Vec<PathBuf>,

    /// Config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start position in milliseconds
    #[arg(long, default_value_t = 0)]
    start_ms: u64,

    /// Playback rate multiplier
    #[arg(long)]
    rate: Option<f64>,

    /// Track volume as NAME=0..100 (NAME is the file name without extension)
    #[arg(long = "volume", value_parser = parse_volume)]
    volumes: Vec<(String, u8)>,

    /// Render without an audio device
    #[arg(long)]
    headless: bool,

    /// Print output devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn parse_volume(arg: &str) -> Result<(String, u8), String> {
    let (name, level) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=LEVEL, got '{}'", arg))?;
    if name.is_empty() {
        return Err("track name is empty".to_string());
    }
    let level: u8 = level
        .trim()
        .parse()
        .map_err(|_| format!("invalid volume level '{}'", level))?;
    if level > 100 {
        return Err(format!("volume {} is out of range 0-100", level));
    }
    Ok((name.to_string(), level))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if args.list_devices {
        for device in get_output_devices().context("Failed to enumerate output devices")? {
            println!("{}", device);
        }
        return Ok(());
    }

    log::info!("stemsync-player starting up");

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = config::load(&config_path);

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());

    // Keep the pacer alive for the whole run; dropping it stops rendering
    let mut _pacer: Option<Pacer> = None;
    let output: Arc<dyn OutputProvider> = if args.headless {
        let headless = Arc::new(HeadlessOutput::new(config.audio.target_sample_rate()));
        _pacer = Some(headless.spawn_pacer(Duration::from_millis(10)));
        log::info!("Headless output at {} Hz", config.audio.target_sample_rate());
        headless
    } else {
        Arc::new(CpalOutputProvider::new(config.audio.clone()))
    };

    let engine = match MixerEngine::start(output.as_ref(), Arc::clone(&clock), config.mixer.clone()) {
        Ok(engine) => Some(Arc::new(engine)),
        Err(e) => {
            log::warn!("Mixer engine unavailable: {}", e);
            None
        }
    };

    let sample_rate = engine
        .as_ref()
        .map(|engine| engine.sample_rate())
        .unwrap_or_else(|| output.preferred_sample_rate());
    let cache = Arc::new(AssetCache::new(config.decoder.options(sample_rate)));
    let loader = Arc::new(
        AssetLoader::spawn(Arc::clone(&cache), config.decoder.loader_workers)
            .context("Failed to start loader threads")?,
    );
    let volumes: Arc<dyn VolumeStore> = Arc::new(YamlVolumeStore::open(&config.volumes_path()));

    let mut session = PlaybackSession::new(
        config.session(),
        SessionServices {
            engine,
            cache,
            loader,
            output,
            volumes,
            clock,
        },
    );

    for path in &args.files {
        match session.add_track(path) {
            Ok(id) => log::info!("Added {} as {}", path.display(), id),
            Err(e) => log::error!("{}", e),
        }
    }
    let tracks = session.track_ids();
    if tracks.is_empty() {
        bail!("No playable tracks");
    }

    for (name, level) in &args.volumes {
        match tracks.iter().find(|&&id| session.track_name(id) == Some(name.as_str())) {
            Some(&id) => session.set_volume(id, *level)?,
            None => log::warn!("--volume: no track named '{}'", name),
        }
    }

    if let Some(rate) = args.rate {
        if !session.set_playback_rate(rate) {
            log::warn!("Playback rate {} not applied: tracks share the mixer engine", rate);
        }
    }

    session.play(args.start_ms)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    runtime.block_on(run(&mut session));

    session.clear();
    log::info!("stemsync-player shutting down");
    Ok(())
}

/// Scheduling loop: tick the session until playback ends or Ctrl-C
async fn run(session: &mut PlaybackSession) {
    let events = session.events();
    let mut interval = tokio::time::interval(TICK_PERIOD);
    let mut ticks = 0u32;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut ctrl_c => {
                log::info!("Interrupted at {}ms", session.get_position_ms());
                session.stop();
                return;
            }
        }

        session.tick();

        for event in events.try_iter() {
            match event {
                SessionEvent::TrackReady(id) => log::info!("{} ready ({})", id, track_label(session, id)),
                SessionEvent::TrackFailed { track, reason } => {
                    log::warn!("{} failed ({}): {}", track, track_label(session, track), reason)
                }
                SessionEvent::PlaybackEnded => {
                    log::info!("Playback finished at {}ms", session.get_position_ms());
                    return;
                }
            }
        }

        if all_failed(session) {
            log::error!("Every track failed to load");
            return;
        }

        ticks = ticks.wrapping_add(1);
        if ticks % PROGRESS_EVERY == 0 {
            log::info!(
                "{}ms / {}ms (spread {}ms)",
                session.get_position_ms(),
                session.get_duration_ms(),
                session.max_divergence_ms()
            );
        }
    }
}

fn track_label(session: &PlaybackSession, id: TrackId) -> String {
    session.track_name(id).unwrap_or("?").to_string()
}

fn all_failed(session: &PlaybackSession) -> bool {
    let ids = session.track_ids();
    !ids.is_empty()
        && ids
            .iter()
            .all(|&id| matches!(session.track_state(id), Some(LoadState::Failed(_))))
}
