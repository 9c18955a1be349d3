use std::path::PathBuf;
use std::process;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use spibridge::{Bridge, BridgeConfig};

mod exercise;

const USAGE: &str = "\
Usage: spibridge <command> [options]

Commands:
  endpoints        List virtual endpoints and the backing target each resolves to
  exercise         Drive every endpoint concurrently and report arbitration results

Options:
  --config <file>      JSON configuration [default: SPIBRIDGE_* environment]
  --backing <path>     Backing device (repeatable; overrides configuration)
  --ndev <n>           Number of endpoints
  --timeout-ms <ms>    Admission timeout, <= 0 waits forever
  --hold-ms <ms>       Ownership hold window, 0 disables
  --per-endpoint       Endpoint i opens backing target i
  --debug              Trace ticket, serving, and ownership transitions
  --loopback           Exercise an in-process loopback device instead of real targets
  --ops <n>            Writes per endpoint for `exercise` [default: 100]
  --frame-len <n>      Bytes per write for `exercise` [default: 16]";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Endpoints,
    Exercise(exercise::Options),
}

#[derive(Debug)]
struct Args {
    command: Command,
    config: Option<PathBuf>,
    backing: Vec<PathBuf>,
    ndev: Option<usize>,
    timeout_ms: Option<i64>,
    hold_ms: Option<u64>,
    per_endpoint: bool,
    debug: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut command: Option<String> = None;
    let mut parsed = Args {
        command: Command::Endpoints,
        config: None,
        backing: Vec::new(),
        ndev: None,
        timeout_ms: None,
        hold_ms: None,
        per_endpoint: false,
        debug: false,
    };
    let mut options = exercise::Options::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--config" => parsed.config = Some(PathBuf::from(value(args, &mut i, "--config")?)),
            "--backing" => parsed.backing.push(PathBuf::from(value(args, &mut i, "--backing")?)),
            "--ndev" => parsed.ndev = Some(number(args, &mut i, "--ndev")?),
            "--timeout-ms" => parsed.timeout_ms = Some(number(args, &mut i, "--timeout-ms")?),
            "--hold-ms" => parsed.hold_ms = Some(number(args, &mut i, "--hold-ms")?),
            "--ops" => options.ops = number(args, &mut i, "--ops")?,
            "--frame-len" => options.frame_len = number(args, &mut i, "--frame-len")?,
            "--per-endpoint" => parsed.per_endpoint = true,
            "--debug" => parsed.debug = true,
            "--loopback" => options.loopback = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if command.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                command = Some(arg.to_string());
            }
        }
        i += 1;
    }

    if options.frame_len == 0 {
        return Err("--frame-len must be at least 1".to_string());
    }

    parsed.command = match command.as_deref() {
        Some("endpoints") => Command::Endpoints,
        Some("exercise") => Command::Exercise(options),
        Some(other) => return Err(format!("unknown command: {other}")),
        None => return Err("missing command".to_string()),
    };
    Ok(parsed)
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn number<T: std::str::FromStr>(args: &[String], i: &mut usize, flag: &str) -> Result<T, String> {
    let raw = value(args, i, flag)?;
    raw.parse()
        .map_err(|_| format!("{flag} expects a number, got {raw:?}"))
}

fn load_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_json_file(path)?,
        None => BridgeConfig::from_env()?,
    };
    if !args.backing.is_empty() {
        config.backing_targets = args.backing.clone();
    }
    if let Some(n) = args.ndev {
        config.endpoint_count = n;
    }
    if let Some(ms) = args.timeout_ms {
        config.admission_timeout_ms = ms;
    }
    if let Some(ms) = args.hold_ms {
        config.ownership_hold_ms = ms;
    }
    config.per_endpoint_backing |= args.per_endpoint;
    config.debug_logging |= args.debug;
    config.validate()?;
    Ok(config)
}

/// Initialize tracing. RUST_LOG wins when set, otherwise SPIBRIDGE_LOG picks the
/// level (debug when `debug` is set); LOG_FORMAT=json selects JSON output.
fn init_tracing(debug: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = if debug {
            "debug"
        } else {
            match std::env::var("SPIBRIDGE_LOG").as_deref() {
                Ok("debug") => "debug",
                Ok("trace") => "trace",
                Ok("warn") | Ok("warning") => "warn",
                Ok("error") => "error",
                _ => "info",
            }
        };
        EnvFilter::new(format!(
            "spibridge={level},spibridge_cli={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args).context("invalid configuration")?;
    init_tracing(config.debug_logging);
    tracing::info!("spibridge {}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Endpoints => {
            for endpoint in Bridge::with_devices(config)?.endpoints() {
                println!("{}\t{}", endpoint.name, endpoint.target.display());
            }
            Ok(())
        }
        Command::Exercise(options) => {
            let report = exercise::run(config, &options)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.interleaved_frames > 0 {
                anyhow::bail!("{} frames were interleaved", report.interleaved_frames);
            }
            Ok(())
        }
    }
}
