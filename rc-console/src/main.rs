mod session;

use std::{env, time::Duration};

use protocol::{Message, RPC_MESSAGE_PATH, RpcCall, RpcReply};
use rustyline::{DefaultEditor, error::ReadlineError};

use crate::session::{ConsoleSession, render_reply};

const DEFAULT_URL: &str = "http://127.0.0.1:8000";
const PASSWORD_ENV: &str = "RC_PASSWORD";
const EXIT_COMMANDS: [&str; 3] = ["salir", "exit", "quit"];

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = match parse_cli_args() {
        Ok(CliAction::Run(cli)) => *cli,
        Ok(CliAction::Help) => {
            print_cli_help();
            return Ok(());
        }
        Ok(CliAction::Version) => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Err(err) => {
            eprintln!("error: {err}\n");
            print_cli_help();
            return Err(err.into());
        }
    };

    let mut editor = DefaultEditor::new()?;
    let user = match cli.user {
        Some(user) => user,
        None => prompt(&mut editor, "Usuario: ")?,
    };
    let password = match cli.password.or_else(|| env::var(PASSWORD_ENV).ok()) {
        Some(password) => password,
        None => prompt(&mut editor, "Contraseña: ")?,
    };

    let client = GatewayClient::new(&cli.url, Duration::from_millis(cli.timeout_ms));
    let mut session = ConsoleSession::new(user, password);

    println!("rc-console conectado a {}", client.endpoint);
    println!("Escriba 'comandos' para ver la ayuda, 'salir' para terminar.");
    loop {
        match editor.readline(&format!("{}> ", session.user())) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                if EXIT_COMMANDS.contains(&line.to_lowercase().as_str()) {
                    break;
                }

                let message = match session.prepare(line) {
                    Ok(message) => message,
                    Err(err) => {
                        println!("Error: {err}");
                        continue;
                    }
                };
                match client.send(&message).await {
                    Ok(reply) => println!("{}", render_reply(&reply)),
                    Err(err) => println!("Error de RPC: {err}"),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }
    println!("Hasta luego.");
    Ok(())
}

fn prompt(editor: &mut DefaultEditor, label: &str) -> Result<String, Box<dyn std::error::Error>> {
    let value = editor.readline(label)?;
    let value = value.trim();
    if value.is_empty() {
        return Err(format!("{} cannot be empty", label.trim_end_matches([':', ' '])).into());
    }
    Ok(value.to_string())
}

struct GatewayClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl GatewayClient {
    fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}{}", normalize_base_url(base_url), RPC_MESSAGE_PATH),
            timeout,
        }
    }

    async fn send(&self, message: &Message) -> Result<String, reqwest::Error> {
        let reply = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&RpcCall {
                message: message.serialize(),
            })
            .send()
            .await?
            .error_for_status()?
            .json::<RpcReply>()
            .await?;
        Ok(reply.result)
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[derive(Clone, Debug)]
struct CliArgs {
    url: String,
    user: Option<String>,
    password: Option<String>,
    timeout_ms: u64,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            user: None,
            password: None,
            timeout_ms: 120_000,
        }
    }
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
            "--url" => cli.url = next_arg_value("--url", &mut args)?,
            "--user" => cli.user = Some(next_arg_value("--user", &mut args)?),
            "--password" => cli.password = Some(next_arg_value("--password", &mut args)?),
            "--timeout-ms" => {
                let value = next_arg_value("--timeout-ms", &mut args)?;
                cli.timeout_ms = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid --timeout-ms: {value}"))?;
            }
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
        "Usage: rc-console [options]\n\n",
        "Options:\n",
        "  --url <URL>              Gateway base URL (default: http://127.0.0.1:8000)\n",
        "  --user <NAME>            Login name (prompted when absent)\n",
        "  --password <SECRET>      Password (default: $RC_PASSWORD, else prompted)\n",
        "  --timeout-ms <MS>        Per-request timeout (default: 120000)\n",
        "  -V, --version            Show version\n",
        "  -h, --help               Show this help\n"
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliAction, String> {
        parse_args(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn editor_failures_surface_as_boxed_errors() {
        let failure: Result<(), Box<dyn std::error::Error>> =
            Err(ReadlineError::Io(std::io::Error::other("tty gone")).into());
        let err = failure.unwrap_err();
        assert!(err.to_string().contains("tty gone"));
    }

    #[test]
    fn defaults_point_at_local_gateway() {
        let Ok(CliAction::Run(cli)) = parse(&[]) else {
            panic!("expected run action");
        };
        assert_eq!(cli.url, DEFAULT_URL);
        assert!(cli.user.is_none());
        assert_eq!(cli.timeout_ms, 120_000);
    }

    #[test]
    fn flags_override_defaults() {
        let Ok(CliAction::Run(cli)) = parse(&[
            "--url",
            "http://robot.local:8000/",
            "--user",
            "ana",
            "--timeout-ms",
            "500",
        ]) else {
            panic!("expected run action");
        };
        assert_eq!(cli.user.as_deref(), Some("ana"));
        assert_eq!(cli.timeout_ms, 500);
        let client = GatewayClient::new(&cli.url, Duration::from_millis(cli.timeout_ms));
        assert_eq!(client.endpoint, "http://robot.local:8000/rpc/v1/message");
        assert!(parse(&["--timeout-ms", "pronto"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }
}
