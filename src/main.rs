use std::{backtrace::Backtrace, fs, path::PathBuf, sync::Arc, time::Instant};

use anyhow::Context as _;
use calloop::{
    EventLoop, LoopSignal, channel,
    signals::{Signal, Signals},
    timer::{TimeoutAction, Timer},
};
use perch::{
    Attach, Perch, PerchError, Result,
    backend::{Session, WindowHandle, WindowSystem, X11Backend},
    config,
    shape::ShapeState,
    snap::{FrameInput, candidate_entry},
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "perch=debug";
const USAGE: &str = "usage: perch [--pid PID | --window ID] | perch windows";

struct App {
    perch: Perch,
    config_path: PathBuf,
    signal: LoopSignal,
}

impl App {
    fn tick(&mut self) {
        if self.perch.shape_state() == ShapeState::Stopped {
            self.signal.stop();
            return;
        }
        self.perch.frame(FrameInput::new(Instant::now()));
    }

    fn reload(&mut self) {
        match config::load_from_path(&self.config_path) {
            Ok(config) => self.perch.reload_config(config),
            Err(err) => tracing::warn!("keeping previous config: {err}"),
        }
    }
}

fn main() -> Result<()> {
    init_backtrace_defaults();
    init_logging()?;
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();
        tracing::error!("panic: {panic_info}\n{backtrace}");
        eprintln!("panic: {panic_info}\n{backtrace}");
    }));

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("windows") {
        if let Err(err) = print_windows() {
            eprintln!("perch windows: {err:#}");
            std::process::exit(1);
        }
        return Ok(());
    }
    let attach = parse_attach(&args)?;

    let loaded = config::load_or_create_default()?;
    tracing::info!(path = %loaded.path.display(), "config loaded");
    let frame_interval = loaded.config.frame_interval();

    let mut event_loop: EventLoop<App> =
        EventLoop::try_new().map_err(|e| PerchError::EventLoop(e.to_string()))?;
    let handle = event_loop.handle();

    // Signals are masked per thread; set them up before the damage thread exists.
    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP])
        .map_err(|err| PerchError::EventLoop(format!("failed to watch signals: {err}")))?;
    handle
        .insert_source(signals, |event, _, app| match event.signal() {
            Signal::SIGHUP => app.reload(),
            signal => {
                tracing::info!(?signal, "shutting down");
                app.signal.stop();
            }
        })
        .map_err(|err| PerchError::EventLoop(format!("failed to insert signal source: {err}")))?;

    let perch = Perch::new(loaded.config, attach)?;

    let (destroyed_tx, destroyed_rx) = channel::channel::<WindowHandle>();
    perch.on_window_destroyed(move |window| {
        if destroyed_tx.send(window).is_err() {
            tracing::debug!("event loop gone before destroy notification");
        }
    });
    handle
        .insert_source(destroyed_rx, |event, _, app| {
            if let channel::Event::Msg(window) = event {
                tracing::info!(window = %window, "pet window destroyed; exiting");
                app.signal.stop();
            }
        })
        .map_err(|err| PerchError::EventLoop(format!("failed to insert destroy channel: {err}")))?;

    handle
        .insert_source(Timer::from_duration(frame_interval), |_, _, app| {
            app.tick();
            TimeoutAction::ToDuration(app.perch.config().frame_interval())
        })
        .map_err(|err| PerchError::EventLoop(format!("failed to schedule frames: {err}")))?;

    let mut app = App {
        perch,
        config_path: loaded.path,
        signal: event_loop.get_signal(),
    };

    event_loop
        .run(None, &mut app, |_| {})
        .map_err(|e| PerchError::EventLoop(e.to_string()))?;

    app.perch.shutdown();
    Ok(())
}

fn parse_attach(args: &[String]) -> Result<Attach> {
    let mut attach = Attach::Pid(std::process::id());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let value = iter.next();
        attach = match (arg.as_str(), value) {
            ("--pid", Some(raw)) => Attach::Pid(raw.parse().map_err(|err| {
                PerchError::Config(format!("invalid --pid {raw}: {err}\n{USAGE}"))
            })?),
            ("--window", Some(raw)) => Attach::Window(WindowHandle(parse_window_id(raw)?)),
            _ => return Err(PerchError::Config(USAGE.to_owned())),
        };
    }
    Ok(attach)
}

fn parse_window_id(raw: &str) -> Result<u32> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|err| PerchError::Config(format!("invalid --window {raw}: {err}\n{USAGE}")))
}

fn print_windows() -> anyhow::Result<()> {
    let session = Arc::new(Session::open().context("failed to connect to X server")?);
    let backend = X11Backend::new(Arc::clone(&session));
    for window in backend.top_level_windows() {
        if let Some(entry) = candidate_entry(&backend, window) {
            println!(
                "{}\t{}\t{}",
                entry.handle,
                entry.rect,
                backend.class_name(entry.handle)
            );
        }
    }
    session.close();
    Ok(())
}

fn init_backtrace_defaults() {
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        // Safety: called at startup before creating any threads.
        unsafe { std::env::set_var("RUST_BACKTRACE", "1") };
    }
    if std::env::var_os("RUST_LIB_BACKTRACE").is_none() {
        // Safety: called at startup before creating any threads.
        unsafe { std::env::set_var("RUST_LIB_BACKTRACE", "0") };
    }
}

fn log_dir() -> Result<PathBuf> {
    if let Some(state) = std::env::var_os("XDG_STATE_HOME")
        && !state.is_empty()
    {
        return Ok(PathBuf::from(state).join("perch"));
    }
    if let Some(home) = std::env::var_os("HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home).join(".local").join("state").join("perch"));
    }
    Err(PerchError::Config(
        "unable to resolve log directory: HOME and XDG_STATE_HOME are unset".to_owned(),
    ))
}

fn init_logging() -> Result<()> {
    let log_dir = log_dir()?;
    fs::create_dir_all(&log_dir).map_err(|err| {
        PerchError::Config(format!(
            "failed to create log directory {}: {err}",
            log_dir.display()
        ))
    })?;

    let file_appender = tracing_appender::rolling::never(&log_dir, "perch.log");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_appender),
        )
        .init();

    let log_file = log_dir.join("perch.log");
    tracing::info!(path = %log_file.display(), "logging initialized");

    Ok(())
}
