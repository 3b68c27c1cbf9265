use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use protocol::{Message, Payload, SERVER_SENDER, normalize};

const UPLOAD_KEYWORD: &str = "upload";
const RUN_KEYWORD: &str = "run";

#[derive(Debug)]
pub enum SessionError {
    MissingArgument(&'static str),
    ReadFile { path: PathBuf, source: io::Error },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::MissingArgument(usage) => write!(f, "uso: {usage}"),
            SessionError::ReadFile { path, source } => {
                write!(f, "no se pudo leer {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Per-login client state: who is talking and the next request id.
pub struct ConsoleSession {
    user: String,
    password: String,
    next_id: i64,
}

impl ConsoleSession {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            next_id: 1,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Turns one console line into the envelope sent to the gateway.
    pub fn prepare(&mut self, input: &str) -> Result<Message, SessionError> {
        let phrase = expand_input(input)?;
        let id = self.next_id;
        self.next_id += 1;
        Ok(Message::new(
            id,
            self.user.clone(),
            self.password.clone(),
            Payload::infer(&phrase),
        ))
    }
}

/// Rewrites the console-only forms (`upload <path>`, `run <file>`) and
/// normalises everything else through the shared alias table.
pub fn expand_input(input: &str) -> Result<String, SessionError> {
    let trimmed = input.trim();
    if let Some(rest) = keyword_argument(trimmed, UPLOAD_KEYWORD) {
        if rest.is_empty() {
            return Err(SessionError::MissingArgument("upload <ruta_local>"));
        }
        if rest.contains("filename=") {
            return Ok(trimmed.to_string());
        }
        return upload_phrase(Path::new(rest));
    }
    if let Some(rest) = keyword_argument(trimmed, RUN_KEYWORD) {
        if rest.is_empty() {
            return Err(SessionError::MissingArgument("run <archivo.gcode>"));
        }
        if rest.contains("filename=") {
            return Ok(trimmed.to_string());
        }
        return Ok(format!("{RUN_KEYWORD} filename={rest}"));
    }
    Ok(normalize(trimmed))
}

fn keyword_argument<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    let head = input.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &input[keyword.len()..];
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn upload_phrase(path: &Path) -> Result<String, SessionError> {
    let bytes = fs::read(path).map_err(|source| SessionError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or(SessionError::MissingArgument("upload <ruta_local>"))?;
    Ok(format!(
        "{UPLOAD_KEYWORD} filename={name} data={}",
        STANDARD.encode(bytes)
    ))
}

/// Reports arrive wrapped in a server envelope; everything else is plain text.
pub fn render_reply(reply: &str) -> String {
    match Message::deserialize(reply) {
        Ok(message) if message.user == SERVER_SENDER => message.payload.as_phrase(),
        _ => reply.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    #[test]
    fn aliases_become_canonical_phrases() {
        assert_eq!(expand_input("HOME").unwrap(), "homing");
        assert_eq!(expand_input("grip off").unwrap(), "desactivar gripper");
        assert_eq!(expand_input("?").unwrap(), "comandos");
        assert_eq!(
            expand_input("move x=10 z=-2.5").unwrap(),
            "mover brazo x=10 z=-2.5"
        );
        assert_eq!(expand_input("  conectar robot ").unwrap(), "conectar robot");
    }

    #[test]
    fn run_is_sent_with_filename_key() {
        assert_eq!(
            expand_input("run pieza.gcode").unwrap(),
            "run filename=pieza.gcode"
        );
        assert_eq!(
            expand_input("run filename=pieza.gcode").unwrap(),
            "run filename=pieza.gcode"
        );
        assert!(matches!(
            expand_input("run"),
            Err(SessionError::MissingArgument(_))
        ));
        assert_eq!(expand_input("runaway").unwrap(), "runaway");
    }

    #[test]
    fn upload_reads_and_encodes_local_file() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!(
            "rc-console-upload-{}-{now}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("prog.gcode");
        fs::write(&path, "M17\nM18\n").unwrap();

        let phrase = expand_input(&format!("upload {}", path.display())).unwrap();
        assert_eq!(phrase, "upload filename=prog.gcode data=TTE3Ck0xOAo=");

        let missing = expand_input(&format!("upload {}", dir.join("nada").display()));
        assert!(matches!(missing, Err(SessionError::ReadFile { .. })));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn ids_increase_and_payload_type_is_inferred() {
        let mut session = ConsoleSession::new("ana", "1234");
        let first = session.prepare("home").unwrap();
        let second = session.prepare("42").unwrap();
        let third = session.prepare("-1.5").unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(third.id, 3);
        assert_eq!(first.serialize(), "1|ana|1234|string|homing");
        assert_eq!(second.payload, Payload::Int(42));
        assert_eq!(third.payload, Payload::Double(-1.5));
        assert!(session.prepare("upload").is_err());
        assert_eq!(session.prepare("rep").unwrap().id, 4);
    }

    #[test]
    fn server_envelopes_are_unwrapped() {
        let wrapped = Message::from_server(9, "----- REPORTE DE USUARIO -----\nUsuario: ana\n");
        assert_eq!(
            render_reply(&wrapped.serialize()),
            "----- REPORTE DE USUARIO -----\nUsuario: ana\n"
        );
        assert_eq!(
            render_reply("Peticion procesada: G28 | Arduino: ok"),
            "Peticion procesada: G28 | Arduino: ok"
        );
        let echoed = Message::new(1, "ana", "x", Payload::Text("hola".to_string()));
        assert_eq!(render_reply(&echoed.serialize()), echoed.serialize());
    }
}
