use crate::config::{PlayerConfig, app_name, version};
use crate::display::{
    AudioSink, LogAudioSink, LogRenderSink, NullAudioSink, NullRenderSink, PacedAudioSink,
    RenderSink,
};
use crate::pipeline::StopReason;
use crate::pipeline::receiver::PlayerCoordinator;
use crate::pipeline::types::Transport;
use crate::utils::net::connect_with_retry;
use anyhow::{Context, Result, bail};
use clap::{Arg, ArgMatches, Command, value_parser};
use log::{error, info};
use std::time::Duration;
use std::{panic, process};
use tracing_subscriber::EnvFilter;

pub mod assets;
pub mod config;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod utils;

fn cli() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON config file; flags override its values."),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Server host for all three connections."),
        )
        .arg(
            Arg::new("video-port")
                .long("video-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("audio-port")
                .long("audio-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("control-port")
                .long("control-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("transport")
                .short('t')
                .long("transport")
                .value_name("raw|timestamped")
                .value_parser(value_parser!(Transport))
                .help("Wire format of the media connections."),
        )
        .arg(
            Arg::new("tolerance")
                .long("tolerance")
                .value_name("SECONDS")
                .value_parser(value_parser!(f64))
                .help("Largest key distance for a matched audio/video pair."),
        )
        .arg(
            Arg::new("horizon")
                .long("horizon")
                .value_name("SECONDS")
                .value_parser(value_parser!(f64))
                .help("Drop units this far behind the playback position."),
        )
        .arg(ms_arg("warm-up", "Buffering time before playback starts."))
        .arg(
            Arg::new("max-frame-len")
                .long("max-frame-len")
                .value_name("BYTES")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("audio-chunk")
                .long("audio-chunk")
                .value_name("BYTES")
                .value_parser(value_parser!(usize))
                .help("Raw PCM chunk size."),
        )
        .arg(ms_arg("connect-timeout", "Give up connecting after this long."))
        .arg(ms_arg("shutdown-grace", "Abort tasks still running this long after a stop."))
        .arg(ms_arg("health-interval", "Interval between health summaries."))
        .arg(ms_arg("stall-threshold", "Warn when no unit arrives for this long."))
        .arg(ms_arg("quit-poll", "How often the render sink's quit flag is checked."))
        .arg(
            Arg::new("sink")
                .short('s')
                .long("sink")
                .value_name("log|null")
                .value_parser(["log", "null"])
                .ignore_case(true)
                .default_value("log")
                .help("Output sinks for video and audio."),
        )
}

fn ms_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_name("MS")
        .value_parser(value_parser!(u64))
        .help(help)
}

fn load_config(matches: &ArgMatches) -> Result<PlayerConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };

    if let Some(host) = matches.get_one::<String>("host") {
        config.host = host.clone();
    }
    let ports = [
        ("video-port", &mut config.video_port),
        ("audio-port", &mut config.audio_port),
        ("control-port", &mut config.control_port),
    ];
    for (name, field) in ports {
        if let Some(port) = matches.get_one::<u16>(name) {
            *field = *port;
        }
    }
    if let Some(transport) = matches.get_one::<Transport>("transport") {
        config.transport = *transport;
    }
    if let Some(tolerance) = matches.get_one::<f64>("tolerance") {
        config.tolerance = *tolerance;
    }
    if let Some(horizon) = matches.get_one::<f64>("horizon") {
        config.staleness_horizon = *horizon;
    }
    if let Some(len) = matches.get_one::<usize>("max-frame-len") {
        config.max_frame_len = *len;
    }
    if let Some(chunk) = matches.get_one::<usize>("audio-chunk") {
        config.audio_chunk_bytes = *chunk;
    }
    let durations = [
        ("warm-up", &mut config.warm_up_ms),
        ("connect-timeout", &mut config.connect_timeout_ms),
        ("shutdown-grace", &mut config.shutdown_grace_ms),
        ("health-interval", &mut config.health_log_interval_ms),
        ("stall-threshold", &mut config.stall_threshold_ms),
        ("quit-poll", &mut config.quit_poll_interval_ms),
    ];
    for (name, field) in durations {
        if let Some(ms) = matches.get_one::<u64>(name) {
            *field = *ms;
        }
    }

    config.validate()?;
    Ok(config)
}

fn sinks(name: &str) -> (Box<dyn RenderSink>, Box<dyn AudioSink>) {
    let device_buffer = Duration::from_millis(assets::AUDIO_DEVICE_BUFFER_MS);
    match name {
        "null" => (
            Box::new(NullRenderSink),
            Box::new(PacedAudioSink::new(NullAudioSink, device_buffer)),
        ),
        _ => (
            Box::new(LogRenderSink::default()),
            Box::new(PacedAudioSink::new(LogAudioSink::default(), device_buffer)),
        ),
    }
}

async fn play(config: PlayerConfig, sink: String) -> Result<()> {
    let coordinator = PlayerCoordinator::new(config.session());
    let control = coordinator.control();

    // gracefully stop playback on Ctrl-C
    let interrupt = coordinator.control();
    ctrlc::set_handler(move || {
        interrupt.stop(StopReason::Interrupted);
    })
    .context("setting Ctrl-C handler")?;

    let timeout = config.connect_timeout();
    let video_addr = config.addr(config.video_port);
    let audio_addr = config.addr(config.audio_port);
    let control_addr = config.addr(config.control_port);

    let connected = tokio::select! {
        _ = control.stopped() => {
            info!("Interrupted while connecting");
            return Ok(());
        }
        connected = async {
            tokio::try_join!(
                connect_with_retry(&video_addr, timeout),
                connect_with_retry(&audio_addr, timeout),
                connect_with_retry(&control_addr, timeout),
            )
        } => connected,
    };
    let (video, audio, control_conn) = connected.context("connecting to server")?;

    let (render, audio_sink) = sinks(&sink);
    let report = coordinator
        .run(video, audio, control_conn, render, audio_sink)
        .await;

    println!("{}", report.health);
    match report.stop_reason {
        Some(reason) => println!("Stopped: {reason}"),
        None => println!("Stopped"),
    }
    if !report.task_errors.is_empty() {
        bail!("{} task(s) failed", report.task_errors.len());
    }
    Ok(())
}

fn run() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config(&matches)?;
    let sink = matches
        .get_one::<String>("sink")
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "log".into());

    info!(
        "{} {}: {} transport, video {}, audio {}, control {}",
        app_name(),
        version(),
        config.transport,
        config.addr(config.video_port),
        config.addr(config.audio_port),
        config.addr(config.control_port)
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(play(config, sink))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // invoke the default handler and exit the process
        orig_hook(panic_info);
        process::exit(105);
    }));

    if let Err(e) = run() {
        error!("{:#}", e);
        process::exit(1);
    }
}
