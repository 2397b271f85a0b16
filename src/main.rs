use log::{error, info};
use marshydro_poller::client::{MarsHydroClient, validate_credentials};
use marshydro_poller::config::{self, Config};
use marshydro_poller::coordinator::{Coordinator, Discovery, Snapshot, registry_entry};
use marshydro_poller::models::marshydro::{Device, DeviceId, DeviceKind, brightness_to_percent, percent_to_brightness};
use marshydro_poller::services::poller::{self, ShutdownSignal};
use std::path::PathBuf;
use std::sync::Arc;

const USAGE: &str = "usage: marshydro-poller [--env-file PATH] [poll | check-login | list | power <id> on|off | brightness <id> <percent>|<level>/255]";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Poll,
    CheckLogin,
    List,
    Power { id: DeviceId, on: bool },
    Brightness { id: DeviceId, percent: u8 },
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    env_file: Option<PathBuf>,
    command: Command,
}

fn parse_cli(args: impl IntoIterator<Item = String>) -> Result<Cli, String> {
    let mut env_file = None;
    let mut positional = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let path = if arg == "--env-file" {
            Some(args.next().ok_or_else(|| "`--env-file` requires a path argument".to_string())?)
        } else if let Some(p) = arg.strip_prefix("--env-file=") {
            Some(p.to_string())
        } else if arg.starts_with("--") {
            return Err(format!("unrecognised argument: {}\n{}", arg, USAGE));
        } else {
            positional.push(arg);
            None
        };
        if let Some(p) = path {
            if p.is_empty() {
                return Err("`--env-file` requires a path argument".to_string());
            }
            if env_file.replace(PathBuf::from(p)).is_some() {
                return Err("`--env-file` provided more than once".to_string());
            }
        }
    }

    let parse_id = |s: &str| {
        s.parse::<i64>()
            .map(DeviceId)
            .map_err(|_| format!("invalid device id: {}", s))
    };
    let command = match positional.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["poll"] => Command::Poll,
        ["check-login"] => Command::CheckLogin,
        ["list"] => Command::List,
        ["power", id, state] => Command::Power {
            id: parse_id(id)?,
            on: match *state {
                "on" => true,
                "off" => false,
                other => return Err(format!("power state must be on or off, got {}", other)),
            },
        },
        ["brightness", id, pct] => Command::Brightness {
            id: parse_id(id)?,
            percent: parse_brightness(pct)?,
        },
        _ => return Err(USAGE.to_string()),
    };

    Ok(Cli { env_file, command })
}

/// Accepts a percentage (`55`) or a host-style level out of 255 (`140/255`).
fn parse_brightness(raw: &str) -> Result<u8, String> {
    let invalid = || format!("invalid brightness: {}", raw);
    match raw.strip_suffix("/255") {
        Some(level) => level.parse::<u8>().map(brightness_to_percent).map_err(|_| invalid()),
        None => raw.parse::<u8>().map_err(|_| invalid()),
    }
}

fn describe(device: &Device) -> String {
    let power = match device.is_on() {
        Some(true) => "on",
        Some(false) => "off",
        None => "-",
    };
    let online = match device.connected {
        Some(true) => "online",
        Some(false) => "offline",
        None => "unknown",
    };
    let detail = match &device.kind {
        DeviceKind::Light(l) => format!(
            "brightness={}% ({}/255)",
            l.light_rate.0,
            percent_to_brightness(l.light_rate)
        ),
        DeviceKind::Fan(f) => format!(
            "speed={}% temperature={}F ({}) humidity={}%",
            f.speed_rate.map(|p| p.0.to_string()).unwrap_or_else(|| "-".into()),
            f.temperature.as_ref().map(|r| r.as_str()).unwrap_or("-"),
            f.temperature_celsius()
                .map(|c| format!("{:.1}C", c))
                .unwrap_or_else(|| "-".into()),
            f.humidity.as_ref().map(|r| r.as_str()).unwrap_or("-"),
        ),
        DeviceKind::Unsupported => String::new(),
    };
    format!("[{}] {} ({}, {}) {} {}", device.id, device.name, power, online, device.product_type.as_wire(), detail)
}

fn log_snapshot(snapshot: &Snapshot) {
    for device in snapshot.devices.values() {
        info!("{}", describe(device));
    }
}

fn run(command: Command) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (poll_interval={}s, token_freshness={}s, request_timeout={}s, api={})",
        cfg.poll_interval.as_secs(),
        cfg.token_freshness.as_secs(),
        cfg.request_timeout.as_secs(),
        cfg.api_url
    );

    if command == Command::CheckLogin {
        return match validate_credentials(cfg.credentials.clone(), cfg.client_options()) {
            Ok(true) => {
                info!("Credentials accepted");
                Ok(())
            }
            Ok(false) => Err("credentials rejected by Mars Hydro cloud".to_string()),
            Err(e) => Err(format!("credential check failed: {}", e)),
        };
    }

    // 2) Init client and discover devices
    let client = MarsHydroClient::new(cfg.credentials.clone(), cfg.client_options());
    let coordinator = Coordinator::new(Arc::new(client));
    match coordinator.setup().map_err(|e| format!("setup failed: {}", e))? {
        Discovery::Devices(n) => info!("Managing {} device(s)", n),
        Discovery::NoDevices if command == Command::Poll => {
            return Err("No supported devices found; ensure the account has lights or fans".into());
        }
        Discovery::NoDevices => {}
    }

    // 3) Dispatch
    match command {
        Command::List => {
            for device in coordinator.snapshot().devices.values() {
                let entry = registry_entry(device);
                println!(
                    "{}\t{}\tmodel={}\tversion={}",
                    describe(device),
                    entry.identifier,
                    entry.model.unwrap_or("-"),
                    entry.sw_version.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Command::Power { id, on } => {
            let device = coordinator.toggle_power(id, !on).map_err(|e| e.to_string())?;
            println!("{}", describe(&device));
            Ok(())
        }
        Command::Brightness { id, percent } => {
            let device = coordinator.set_brightness(id, percent).map_err(|e| e.to_string())?;
            println!("{}", describe(&device));
            Ok(())
        }
        Command::Poll => {
            coordinator.subscribe(log_snapshot);
            info!("Starting poll loop: interval={}s", cfg.poll_interval.as_secs());
            poller::run_loop(&coordinator, cfg.poll_interval, &ShutdownSignal::new())
        }
        Command::CheckLogin => Ok(()),
    }
}

fn main() {
    let cli = match parse_cli(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(2);
        }
    };

    let env_file = cli
        .env_file
        .clone()
        .or_else(|| Some(PathBuf::from(".env")).filter(|p| p.is_file()));
    let loaded = match env_file.as_deref().map(config::load_env_file).transpose() {
        Ok(n) => n,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let (Some(path), Some(applied)) = (env_file.as_ref(), loaded) {
        info!("Environment loaded from {} ({} variable(s))", path.display(), applied);
    }

    info!(
        "marshydro-poller {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(cli.command) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_to_poll() {
        let cli = parse_cli(args(&[])).unwrap();
        assert_eq!(cli.command, Command::Poll);
        assert_eq!(cli.env_file, None);
    }

    #[test]
    fn parses_commands_and_env_file() {
        let cli = parse_cli(args(&["--env-file", "prod.env", "power", "12", "off"])).unwrap();
        assert_eq!(cli.env_file, Some(PathBuf::from("prod.env")));
        assert_eq!(cli.command, Command::Power { id: DeviceId(12), on: false });

        let cli = parse_cli(args(&["brightness", "3", "55", "--env-file=x.env"])).unwrap();
        assert_eq!(cli.command, Command::Brightness { id: DeviceId(3), percent: 55 });
        assert_eq!(cli.env_file, Some(PathBuf::from("x.env")));

        assert_eq!(parse_cli(args(&["check-login"])).unwrap().command, Command::CheckLogin);
        assert_eq!(parse_cli(args(&["list"])).unwrap().command, Command::List);

        let cli = parse_cli(args(&["brightness", "3", "255/255"])).unwrap();
        assert_eq!(cli.command, Command::Brightness { id: DeviceId(3), percent: 100 });
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_cli(args(&["--env-file"])).is_err());
        assert!(parse_cli(args(&["--env-file=a", "--env-file=b"])).is_err());
        assert!(parse_cli(args(&["--verbose"])).is_err());
        assert!(parse_cli(args(&["power", "x", "on"])).is_err());
        assert!(parse_cli(args(&["power", "1", "dim"])).is_err());
        assert!(parse_cli(args(&["brightness", "1", "300"])).is_err());
        assert!(parse_cli(args(&["dance"])).is_err());
    }
}
