use std::{env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use gateway::{
    CsvAuditLog, DeviceConfig, DeviceSession, DeviceTimings, Dispatcher, FileCredentialStore,
    PortOpener, SharedState, SimulatedDevice, SystemPorts, UploadStore, build_rpc_app,
    init_logging,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = match parse_cli_args() {
        Ok(CliAction::Run(cli)) => *cli,
        Ok(CliAction::Help) => {
            print_cli_help();
            return Ok(());
        }
        Ok(CliAction::Version) => {
            println!("{}", binary_version_text());
            return Ok(());
        }
        Err(err) => {
            eprintln!("error: {err}\n");
            print_cli_help();
            return Err(err.into());
        }
    };

    init_logging()?;
    info!("{}", binary_version_text());

    let addr = if let Some(value) = cli.addr {
        value
    } else {
        "0.0.0.0:8000".parse()?
    };
    let users_path = cli
        .users_path
        .unwrap_or_else(|| PathBuf::from("db/usuarios.json"));
    let audit_path = cli
        .audit_path
        .unwrap_or_else(|| PathBuf::from("logs/Log_de_trabajo.csv"));
    let uploads_dir = cli.uploads_dir.unwrap_or_else(|| PathBuf::from("uploads"));

    let credentials = FileCredentialStore::load(&users_path)
        .map_err(|err| format!("{}: {err}", users_path.display()))?;
    if credentials.is_empty() {
        warn!("credential file {} has no users", users_path.display());
    }
    let audit = CsvAuditLog::open(&audit_path)
        .map_err(|err| format!("failed to open audit log {}: {err}", audit_path.display()))?;
    info!("audit log at {}", audit.path().display());

    let opener: Arc<dyn PortOpener> = if cli.simulate {
        warn!("using simulated device, no serial port will be opened");
        Arc::new(SimulatedDevice::new().with_reply("M114", "X:0.00 Y:0.00 Z:0.00"))
    } else {
        Arc::new(SystemPorts)
    };
    let device_config = DeviceConfig {
        port: cli.serial_port,
        baud: cli.baud.unwrap_or(115_200),
        base_timeout: Duration::from_millis(cli.timeout_ms.unwrap_or(1_000)),
        timings: DeviceTimings::default(),
    };

    let audit = Arc::new(audit);
    let dispatcher = Dispatcher::new(
        DeviceSession::new(device_config, opener),
        UploadStore::new(uploads_dir),
        audit.clone(),
    );
    let state = SharedState::new(dispatcher, Arc::new(credentials), audit);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("rpc endpoint listening on http://{}", listener.local_addr()?);

    if cli.no_autoconnect {
        info!("startup device connect skipped");
    } else {
        let dispatcher = state.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.connect_on_startup().await;
        });
    }

    axum::serve(listener, build_rpc_app(state)).await?;
    Ok(())
}

#[derive(Clone, Debug, Default)]
struct CliArgs {
    addr: Option<SocketAddr>,
    serial_port: Option<String>,
    baud: Option<u32>,
    timeout_ms: Option<u64>,
    uploads_dir: Option<PathBuf>,
    audit_path: Option<PathBuf>,
    users_path: Option<PathBuf>,
    no_autoconnect: bool,
    simulate: bool,
}

enum CliAction {
    Run(Box<CliArgs>),
    Help,
    Version,
}

fn parse_cli_args() -> Result<CliAction, String> {
    parse_args(env::args().skip(1))
}

fn parse_args(raw: impl Iterator<Item = String>) -> Result<CliAction, String> {
    let mut args = raw.peekable();
    let mut cli = CliArgs::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliAction::Help),
            "-V" | "--version" => return Ok(CliAction::Version),
            "--addr" => {
                let value = next_arg_value("--addr", &mut args)?;
                cli.addr = Some(
                    value
                        .parse::<SocketAddr>()
                        .map_err(|_| format!("invalid --addr: {value}"))?,
                );
            }
            "--serial-port" => {
                cli.serial_port = Some(next_arg_value("--serial-port", &mut args)?);
            }
            "--baud" => {
                let value = next_arg_value("--baud", &mut args)?;
                cli.baud = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| format!("invalid --baud: {value}"))?,
                );
            }
            "--timeout-ms" => {
                let value = next_arg_value("--timeout-ms", &mut args)?;
                cli.timeout_ms = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("invalid --timeout-ms: {value}"))?,
                );
            }
            "--uploads-dir" => {
                cli.uploads_dir = Some(PathBuf::from(next_arg_value("--uploads-dir", &mut args)?));
            }
            "--audit-log" => {
                cli.audit_path = Some(PathBuf::from(next_arg_value("--audit-log", &mut args)?));
            }
            "--users" => {
                cli.users_path = Some(PathBuf::from(next_arg_value("--users", &mut args)?));
            }
            "--no-autoconnect" => cli.no_autoconnect = true,
            "--simulate" => cli.simulate = true,
            _ => {
                return Err(format!("unknown argument: {arg}"));
            }
        }
    }
    Ok(CliAction::Run(Box::new(cli)))
}

fn next_arg_value(
    flag: &str,
    args: &mut std::iter::Peekable<impl Iterator<Item = String>>,
) -> Result<String, String> {
    let value = args
        .next()
        .ok_or_else(|| format!("missing value for {flag}"))?;
    if value.trim().is_empty() {
        return Err(format!("value for {flag} cannot be empty"));
    }
    Ok(value)
}

fn print_cli_help() {
    eprintln!(concat!(
        "Usage: rc-gateway [options]\n\n",
        "Options:\n",
        "  --addr <ADDR>            RPC listen address (default: 0.0.0.0:8000)\n",
        "  --serial-port <PATH>     Device port (default: first /dev/ttyUSB* or /dev/ttyACM*)\n",
        "  --baud <RATE>            Serial baud rate (default: 115200)\n",
        "  --timeout-ms <MS>        Base device response window (default: 1000)\n",
        "  --uploads-dir <DIR>      Uploaded programs and recordings (default: uploads)\n",
        "  --audit-log <PATH>       CSV audit log (default: logs/Log_de_trabajo.csv)\n",
        "  --users <PATH>           Credential file, JSON (default: db/usuarios.json)\n",
        "  --no-autoconnect         Do not connect to the device at startup\n",
        "  --simulate               Use an in-process simulated device\n",
        "  -V, --version            Show version with git metadata\n",
        "  -h, --help               Show this help\n"
    ));
}

fn binary_version_text() -> String {
    let binary = env!("CARGO_PKG_NAME");
    let git_tag = option_env!("RC_BUILD_GIT_TAG").unwrap_or("untagged");
    let git_commit = option_env!("RC_BUILD_GIT_COMMIT").unwrap_or("unknown");
    let git_dirty = option_env!("RC_BUILD_GIT_DIRTY").unwrap_or("false");
    let dirty = matches!(git_dirty, "true" | "1" | "yes" | "dirty");

    if dirty {
        format!("{binary} {git_tag} (dirty commit: {git_commit})")
    } else {
        format!("{binary} {git_tag}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliAction, String> {
        parse_args(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn flags_are_collected() {
        let Ok(CliAction::Run(cli)) = parse(&[
            "--addr",
            "127.0.0.1:9000",
            "--serial-port",
            "/dev/ttyACM1",
            "--baud",
            "9600",
            "--no-autoconnect",
        ]) else {
            panic!("expected run action");
        };
        assert_eq!(cli.addr, Some("127.0.0.1:9000".parse::<SocketAddr>().unwrap()));
        assert_eq!(cli.serial_port.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(cli.baud, Some(9600));
        assert!(cli.no_autoconnect);
        assert!(!cli.simulate);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(parse(&["--baud", "rapido"]).is_err());
        assert!(parse(&["--addr"]).is_err());
        assert!(parse(&["--users", " "]).is_err());
        assert!(parse(&["--mystery"]).is_err());
        assert!(matches!(parse(&["-V"]), Ok(CliAction::Version)));
    }
}
