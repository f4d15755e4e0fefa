use std::borrow::Cow;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use septet::config::{LoggingConfig, PortKind, Settings};
use septet::control::{halt, Firmware, FirmwareOptions, MonotonicClock};
use septet::display::{model_summary_json, render_model};
use septet::engine::{get_engine_by_name, Engine, EMBEDDED_MODEL};
use septet::serial::{open_device, open_stdio, MemoryPort, SerialPort, LINE_TERMINATOR};

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "septet", version, about = "Seven integers in, one quantized prediction out")]
struct Cli {
    /// Directory holding default.toml and an optional local.toml
    #[arg(long, global = true, default_value = "config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the serial command loop (default)
    Run {
        /// Use this character device instead of the configured port
        #[arg(long)]
        device: Option<PathBuf>,
    },
    /// Feed one command line through the firmware and print the transcript
    Eval {
        /// Comma separated integers, without the trailing CR
        line: String,
    },
    /// Describe a model artifact
    Inspect {
        /// Artifact to read instead of the configured one
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

/// Main entry point for the septet harness
///
/// `run` needs a readable config directory. `eval` and `inspect` fall back
/// to the built-in defaults when it is missing.
fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run { device: None }) {
        Command::Run { device } => {
            let mut settings = Settings::from_dir(&cli.config_dir)?;
            if let Some(device) = device {
                settings.serial.port = PortKind::Device;
                settings.serial.device = Some(device);
            }
            let _guard = init_logging(&settings.logging)?;
            run(&settings)
        }
        Command::Eval { line } => {
            let settings = load_or_default(&cli.config_dir)?;
            let _guard = init_logging(&settings.logging)?;
            eval(&settings, &line)
        }
        Command::Inspect { model, json } => {
            let settings = load_or_default(&cli.config_dir)?;
            inspect(&settings, model.as_deref(), json)
        }
    }
}

fn load_or_default(config_dir: &Path) -> Result<Settings, BoxError> {
    if config_dir.exists() {
        Ok(Settings::from_dir(config_dir)?)
    } else {
        Ok(Settings::default())
    }
}

/// Rolling daily log file. Serial traffic owns stdout, so nothing is logged
/// to the console. `RUST_LOG` overrides the configured level.
fn init_logging(logging: &LoggingConfig) -> Result<WorkerGuard, BoxError> {
    std::fs::create_dir_all(&logging.directory)?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::new(
        tracing_appender::rolling::Rotation::DAILY,
        &logging.directory,
        "septet",
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_line_number(true)
        .with_file(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false);

    if logging.json {
        builder.json().try_init()?;
    } else {
        builder.try_init()?;
    }

    let full_log_path = std::fs::canonicalize(&logging.directory)?;
    info!("Log directory: {}", full_log_path.display());
    Ok(guard)
}

fn select_engine(settings: &Settings) -> Result<Box<dyn Engine>, BoxError> {
    get_engine_by_name(&settings.model.engine)
        .ok_or_else(|| format!("Unknown engine: {}", settings.model.engine).into())
}

fn model_bytes(path: Option<&Path>) -> Result<Cow<'static, [u8]>, BoxError> {
    match path {
        Some(path) => {
            info!("Loading model artifact from {}", path.display());
            Ok(Cow::Owned(std::fs::read(path)?))
        }
        None => Ok(Cow::Borrowed(EMBEDDED_MODEL)),
    }
}

fn run(settings: &Settings) -> Result<(), BoxError> {
    let engine = select_engine(settings)?;
    let bytes = model_bytes(settings.model.path.as_deref())?;
    let options = FirmwareOptions::from_settings(settings);
    let backoff = Duration::from_micros(settings.serial.idle_backoff_us);

    match settings.serial.port {
        PortKind::Stdio => serve(engine.as_ref(), &bytes, &options, open_stdio()?, backoff),
        PortKind::Device => {
            let path = settings
                .serial
                .device
                .as_deref()
                .ok_or("serial.device is not set")?;
            let port = open_device(path, settings.serial.baud_rate)?;
            serve(engine.as_ref(), &bytes, &options, port, backoff)
        }
    }
}

fn serve<P: SerialPort>(
    engine: &dyn Engine,
    bytes: &[u8],
    options: &FirmwareOptions,
    port: P,
    backoff: Duration,
) -> Result<(), BoxError> {
    let mut firmware = match Firmware::start(engine, bytes, options, port, MonotonicClock::new()) {
        Ok(firmware) => firmware,
        Err(_) => halt(),
    };
    firmware.run(backoff)?;
    info!("Serial loop finished");
    Ok(())
}

fn eval(settings: &Settings, line: &str) -> Result<(), BoxError> {
    let engine = select_engine(settings)?;
    let bytes = model_bytes(settings.model.path.as_deref())?;
    let options = FirmwareOptions {
        startup_delay: Duration::ZERO,
        ..FirmwareOptions::from_settings(settings)
    };

    let mut port = MemoryPort::with_input(line.as_bytes());
    port.feed(&[LINE_TERMINATOR]);
    port.close();

    let started = Firmware::start(engine.as_ref(), &bytes, &options, &mut port, MonotonicClock::new())
        .map(|mut firmware| firmware.run(Duration::ZERO));

    print!("{}", port.output_lossy());
    match started {
        Ok(result) => Ok(result?),
        Err(e) => {
            warn!("Eval aborted: {}", e);
            Err(e.into())
        }
    }
}

fn inspect(settings: &Settings, path: Option<&Path>, json: bool) -> Result<(), BoxError> {
    let engine = select_engine(settings)?;
    let bytes = model_bytes(path.or(settings.model.path.as_deref()))?;
    let model = engine.load(&bytes)?;

    if json {
        let summary = model_summary_json(&model, settings.model.arena_size);
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", render_model(&model, settings.model.arena_size));
    }
    Ok(())
}
