use std::sync::{
    Mutex as StdMutex,
    atomic::{AtomicBool, Ordering},
};

use protocol::{
    CONNECT_DEVICE, DISCONNECT_DEVICE, FINISH_RECORDING, HELP_ALIASES, Message, REPORT,
    START_RECORDING, normalize,
};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, info};

use crate::{
    audit::{AuditCode, AuditEntry, AuditKind, AuditLevel, NO_CORRELATION, SharedAudit},
    credentials::Role,
    device::DeviceSession,
    logging::Category,
    recording::{Recorder, RecordingError, RecordingStatus},
    report::{DISCONNECTED_STATUS, UserReport},
    translator::{POSITION_QUERY_LINE, translate},
    uploads::{StoreError, UploadStore, sanitize_name},
};

pub const HELP_TEXT: &str = "Comandos usuario:\n\
  on | off | grip on | grip off | home | reporte | status\n\
  abs | rel | move x=.. y=.. z=.. (mover brazo x=.. y=.. z=..)\n\
  upload <archivo.gcode> | run <archivo.gcode>\n\
  guardar trayectoria=<archivo.gcode>\n\
  fin trayectoria\n\
Comandos admin:\n\
  admin acceso on | admin acceso off\n\
  admin log N  (ultimas N lineas del log)\n\
  conectar robot | desconectar robot (solo admin)\n";

pub const DEFAULT_LOG_LINES: usize = 50;

const ACCESS_ON: &str = "admin acceso on";
const ACCESS_OFF: &str = "admin acceso off";
const LOG_PREFIX: &str = "admin log";
const UPLOAD_PREFIX: &str = "upload ";
const RUN_KEYWORD: &str = "run";

const PERMISSION_DENIED: &str = "Permiso denegado: requiere admin.";
const REMOTE_ACCESS_DISABLED: &str = "Acceso remoto deshabilitado por el administrador.";
const DEVICE_DISCONNECTED: &str = "Error: robot desconectado. (Use 'conectar robot' si es admin)";
const RUN_DEVICE_DISCONNECTED: &str =
    "Error: archivo listo pero robot desconectado. Use 'conectar robot' si es admin.";

/// State that only one request may touch at a time: the serial device and
/// the recorder deciding whether commands reach it.
pub struct GatewayCore {
    pub device: DeviceSession,
    pub recorder: Recorder,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatcherSnapshot {
    pub device_connected: bool,
    pub device_port: Option<String>,
    pub recording: RecordingStatus,
    pub remote_access: bool,
}

/// Routes authenticated requests through the command ladder.
pub struct Dispatcher {
    core: Mutex<GatewayCore>,
    /// What the core looked like when the lock was last released.
    last_seen: StdMutex<DispatcherSnapshot>,
    remote_access: AtomicBool,
    audit: SharedAudit,
    uploads: UploadStore,
}

struct Request<'a> {
    id: i64,
    user: &'a str,
    role: Role,
    phrase: String,
    lowered: String,
}

impl Dispatcher {
    pub fn new(device: DeviceSession, uploads: UploadStore, audit: SharedAudit) -> Self {
        let core = GatewayCore {
            device,
            recorder: Recorder::new(),
        };
        Self {
            last_seen: StdMutex::new(view_of(&core, true)),
            core: Mutex::new(core),
            remote_access: AtomicBool::new(true),
            audit,
            uploads,
        }
    }

    pub fn remote_access(&self) -> bool {
        self.remote_access.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> &UploadStore {
        &self.uploads
    }

    /// Never waits on the core: while a request holds it, the state seen
    /// when it was last released is reported.
    pub fn snapshot(&self) -> DispatcherSnapshot {
        let mut snapshot = match self.core.try_lock() {
            Ok(core) => self.remember(&core),
            Err(_) => self.cached().clone(),
        };
        snapshot.remote_access = self.remote_access();
        snapshot
    }

    fn remember(&self, core: &GatewayCore) -> DispatcherSnapshot {
        let snapshot = view_of(core, self.remote_access());
        *self.cached() = snapshot.clone();
        snapshot
    }

    fn cached(&self) -> std::sync::MutexGuard<'_, DispatcherSnapshot> {
        self.last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Best-effort connect used once at startup. Failure is logged only.
    pub async fn connect_on_startup(&self) -> bool {
        let mut core = self.core.lock().await;
        let connected = match core.device.connect(None).await {
            Ok(port) => {
                self.event(
                    AuditLevel::Info,
                    format!("Conexión serie con robot establecida en {port}"),
                    AuditCode::Ok,
                    NO_CORRELATION,
                );
                true
            }
            Err(err) => {
                self.event(
                    AuditLevel::Warning,
                    format!("No se pudo establecer conexión serie con el robot: {err}"),
                    AuditCode::ServerError,
                    NO_CORRELATION,
                );
                false
            }
        };
        self.remember(&core);
        connected
    }

    pub async fn handle(&self, message: &Message, role: Role) -> String {
        let phrase = normalize(&message.payload.as_phrase());
        let request = Request {
            id: message.id,
            user: &message.user,
            role,
            lowered: phrase.to_lowercase(),
            phrase,
        };
        debug!(
            "{} id={} user={} role={} phrase={:?}",
            Category::Dispatch,
            request.id,
            request.user,
            request.role,
            request.phrase
        );

        if HELP_ALIASES.contains(&request.lowered.as_str()) {
            return HELP_TEXT.to_string();
        }
        if request.lowered == ACCESS_ON || request.lowered == ACCESS_OFF {
            return self.toggle_remote_access(&request);
        }
        if let Some(rest) = request.lowered.strip_prefix(LOG_PREFIX)
            && (rest.is_empty() || rest.starts_with(' '))
        {
            return self.read_log(&request, rest);
        }
        if !self.remote_access() && !is_introspection(&request.lowered) {
            self.event_by(
                &request,
                AuditLevel::Info,
                format!(
                    "Peticion rechazada por acceso remoto OFF: {}",
                    request.phrase
                ),
                AuditCode::BadRequest,
            );
            return REMOTE_ACCESS_DISABLED.to_string();
        }

        let mut core = self.core.lock().await;
        let reply = self.route_locked(&mut core, &request).await;
        self.remember(&core);
        reply
    }

    /// The rungs that need the device or the recorder.
    async fn route_locked(&self, core: &mut GatewayCore, request: &Request<'_>) -> String {
        if request.lowered == CONNECT_DEVICE {
            return self.connect_device(core, request).await;
        }
        if request.lowered == DISCONNECT_DEVICE {
            return self.disconnect_device(core, request);
        }
        if request.lowered.starts_with(START_RECORDING) {
            return self.start_recording(core, request);
        }
        if request.lowered == FINISH_RECORDING {
            return self.finish_recording(core, request);
        }
        if core.recorder.is_active() {
            return self.capture(core, request);
        }
        if request.lowered.starts_with(UPLOAD_PREFIX) {
            return self.upload(request);
        }
        if let Some(rest) = request.lowered.strip_prefix(RUN_KEYWORD)
            && (rest.is_empty() || rest.starts_with(' '))
        {
            return self.run(core, request).await;
        }
        if request.lowered == REPORT {
            return self.report(core, request).await;
        }
        self.execute(core, request).await
    }

    fn toggle_remote_access(&self, request: &Request<'_>) -> String {
        if !request.role.is_admin() {
            self.denied(request, "Intento cambiar acceso remoto sin privilegios");
            return PERMISSION_DENIED.to_string();
        }
        let enable = request.lowered == ACCESS_ON;
        self.remote_access.store(enable, Ordering::SeqCst);
        self.event_by(
            request,
            AuditLevel::Info,
            format!("Acceso remoto: {}", if enable { "ON" } else { "OFF" }),
            AuditCode::Ok,
        );
        format!(
            "Acceso remoto: {}",
            if enable { "habilitado" } else { "deshabilitado" }
        )
    }

    fn read_log(&self, request: &Request<'_>, argument: &str) -> String {
        if !request.role.is_admin() {
            self.denied(request, "Intento leer log sin privilegios");
            return PERMISSION_DENIED.to_string();
        }
        let count = argument.trim().parse().unwrap_or(DEFAULT_LOG_LINES);
        let mut text = String::new();
        for line in self.audit.tail(count) {
            text.push_str(&line);
            text.push('\n');
        }
        text
    }

    async fn connect_device(&self, core: &mut GatewayCore, request: &Request<'_>) -> String {
        if !request.role.is_admin() {
            self.denied(request, "Intento de conectar robot sin privilegios");
            return "Permiso denegado: solo el administrador puede conectar el robot.".to_string();
        }
        if core.device.is_connected() {
            return "El robot ya estaba conectado.".to_string();
        }
        match core.device.connect(None).await {
            Ok(port) => {
                self.event_by(
                    request,
                    AuditLevel::Info,
                    format!("Robot conectado por administrador en {port}"),
                    AuditCode::Ok,
                );
                "Robot conectado correctamente.".to_string()
            }
            Err(err) => {
                self.event_by(
                    request,
                    AuditLevel::Error,
                    format!("Fallo al conectar robot por administrador: {err}"),
                    AuditCode::ServerError,
                );
                format!("Error al conectar el robot: {err}")
            }
        }
    }

    fn disconnect_device(&self, core: &mut GatewayCore, request: &Request<'_>) -> String {
        if !request.role.is_admin() {
            self.denied(request, "Intento de desconectar robot sin privilegios");
            return "Permiso denegado: solo el administrador puede desconectar el robot."
                .to_string();
        }
        if !core.device.disconnect() {
            return "El robot ya estaba desconectado.".to_string();
        }
        self.event_by(
            request,
            AuditLevel::Info,
            "Robot desconectado por administrador",
            AuditCode::Ok,
        );
        "Robot desconectado.".to_string()
    }

    fn start_recording(&self, core: &mut GatewayCore, request: &Request<'_>) -> String {
        let raw = extract_kv(&request.phrase, START_RECORDING)
            .or_else(|| {
                request
                    .phrase
                    .split_once('=')
                    .map(|(_, value)| value.trim().to_string())
            })
            .unwrap_or_default();

        match core.recorder.start(&self.uploads, &raw) {
            Ok(name) => {
                self.record_request(request, &format!("{START_RECORDING}={name}"));
                format!(
                    "Grabación iniciada: {name}. Envíe comandos paso a paso y finalice con '{FINISH_RECORDING}'."
                )
            }
            Err(RecordingError::AlreadyActive(name)) => {
                format!("Ya hay una grabación en curso: {name}")
            }
            Err(RecordingError::EmptyName) => {
                self.event_by(
                    request,
                    AuditLevel::Error,
                    "guardar trayectoria: nombre vacío",
                    AuditCode::BadRequest,
                );
                "Error: use guardar trayectoria=<nombre>.gcode".to_string()
            }
            Err(err) => {
                self.event_by(
                    request,
                    AuditLevel::Error,
                    format!("guardar trayectoria: {err}"),
                    AuditCode::ServerError,
                );
                format!(
                    "Error: no se pudo crear el archivo en {}.",
                    self.uploads.root().display()
                )
            }
        }
    }

    fn finish_recording(&self, core: &mut GatewayCore, request: &Request<'_>) -> String {
        match core.recorder.finish() {
            Ok(name) => {
                self.record_request(request, FINISH_RECORDING);
                format!("Grabación finalizada: {name}. Puede ejecutar con 'run {name}'")
            }
            Err(_) => "No hay grabación activa.".to_string(),
        }
    }

    fn capture(&self, core: &mut GatewayCore, request: &Request<'_>) -> String {
        let line = match translate(&request.lowered) {
            Ok(line) => line,
            Err(err) => {
                self.event_by(
                    request,
                    AuditLevel::Error,
                    format!("Grabación: error al interpretar '{}'", request.phrase),
                    AuditCode::BadRequest,
                );
                return format!("Error al interpretar comando durante grabación: {err}");
            }
        };

        match core.recorder.capture(&line) {
            Ok(name) => {
                self.record_request(request, &format!("grabar {name}: {line}"));
                format!("Guardado en {name}: {line}")
            }
            Err(err) => {
                self.event_by(
                    request,
                    AuditLevel::Error,
                    format!("Grabación: error al escribir '{line}': {err}"),
                    AuditCode::ServerError,
                );
                "Error: no se pudo escribir en archivo de grabación.".to_string()
            }
        }
    }

    fn upload(&self, request: &Request<'_>) -> String {
        let (Some(name), Some(data)) = (
            extract_kv(&request.phrase, "filename"),
            extract_kv(&request.phrase, "data"),
        ) else {
            self.event_by(
                request,
                AuditLevel::Error,
                "Upload con formato invalido",
                AuditCode::BadRequest,
            );
            return "Error: formato de upload invalido. Use: upload filename=<NOMBRE> data=<BASE64>"
                .to_string();
        };

        match self.uploads.save_base64(&name, &data) {
            Ok(path) => {
                let stored = sanitize_name(&name).unwrap_or(name);
                info!(
                    "{} stored upload {} ({})",
                    Category::Dispatch,
                    stored,
                    path.display()
                );
                self.record_request(request, &format!("upload {stored}"));
                format!("Archivo subido: {stored}")
            }
            Err(StoreError::InvalidName(_)) => {
                self.event_by(
                    request,
                    AuditLevel::Error,
                    "Upload con nombre de archivo invalido",
                    AuditCode::BadRequest,
                );
                "Error: formato de upload invalido. Use: upload filename=<NOMBRE> data=<BASE64>"
                    .to_string()
            }
            Err(StoreError::Decode(_)) => {
                self.event_by(
                    request,
                    AuditLevel::Error,
                    "Upload base64 invalido",
                    AuditCode::BadRequest,
                );
                "Error: base64 invalido.".to_string()
            }
            Err(err) => {
                self.event_by(
                    request,
                    AuditLevel::Error,
                    format!("Fallo al guardar archivo: {err}"),
                    AuditCode::ServerError,
                );
                format!(
                    "Error: no se pudo guardar el archivo en '{}'.",
                    self.uploads.root().display()
                )
            }
        }
    }

    async fn run(&self, core: &mut GatewayCore, request: &Request<'_>) -> String {
        let raw = extract_kv(&request.phrase, "filename").unwrap_or_else(|| {
            request
                .phrase
                .get(RUN_KEYWORD.len()..)
                .unwrap_or_default()
                .trim()
                .to_string()
        });
        let Ok(name) = sanitize_name(&raw) else {
            self.event_by(
                request,
                AuditLevel::Error,
                "Run con formato invalido",
                AuditCode::BadRequest,
            );
            return "Error: formato de run invalido. Use: run filename=<NOMBRE> o run <NOMBRE>"
                .to_string();
        };

        if !self.uploads.exists(&name) {
            self.event_by(
                request,
                AuditLevel::Error,
                format!("Run: archivo inexistente: {name}"),
                AuditCode::BadRequest,
            );
            return format!(
                "Error: archivo no encontrado en '{}'. Primero haga upload.",
                self.uploads.root().display()
            );
        }
        if !core.device.is_connected() {
            self.event_by(
                request,
                AuditLevel::Warning,
                format!("Run pedido pero robot desconectado: {name}"),
                AuditCode::BadRequest,
            );
            return RUN_DEVICE_DISCONNECTED.to_string();
        }

        let lines = match self.uploads.read_lines(&name) {
            Ok(lines) => lines,
            Err(err) => {
                self.event_by(
                    request,
                    AuditLevel::Error,
                    format!("Run: no se pudo leer {name}: {err}"),
                    AuditCode::ServerError,
                );
                return format!("Error: no se pudo leer el archivo {name}.");
            }
        };

        let pacing = core.device.timings().line_pacing;
        let mut transcript = String::new();
        let mut sent = 0usize;
        for line in lines.iter().map(|line| line.trim()).filter(|line| !line.is_empty()) {
            if sent > 0 {
                sleep(pacing).await;
            }
            sent += 1;
            let reply = core.device.send(line).await;
            transcript.push_str(&format!("L{sent}: `{line}` -> `{reply}`\n"));
        }
        info!(
            "{} ran {name}: {sent} lines sent",
            Category::Dispatch
        );

        self.record_request(request, &format!("run {name}"));
        format!("Ejecucion completada: {name} ({sent} lineas)\n{transcript}")
    }

    async fn report(&self, core: &mut GatewayCore, request: &Request<'_>) -> String {
        let requests = self.audit.entries_of_kind(AuditKind::Request, request.user);
        let connected = core.device.is_connected();
        let status = if connected {
            core.device.send(POSITION_QUERY_LINE).await
        } else {
            DISCONNECTED_STATUS.to_string()
        };
        let text = UserReport::new(request.user)
            .with_requests(requests)
            .with_device(core.device.is_connected(), status)
            .render();

        self.event_by(
            request,
            AuditLevel::Info,
            format!("Reporte generado para {}", request.user),
            AuditCode::Ok,
        );
        Message::from_server(request.id, text).serialize()
    }

    async fn execute(&self, core: &mut GatewayCore, request: &Request<'_>) -> String {
        let line = match translate(&request.lowered) {
            Ok(line) => line,
            Err(err) => {
                self.event_by(
                    request,
                    AuditLevel::Error,
                    format!("Error al interpretar comando: {}", request.phrase),
                    AuditCode::BadRequest,
                );
                return format!("Error al interpretar la petición: {err}");
            }
        };

        self.record_request(request, &request.phrase);

        if !core.device.is_connected() {
            self.event_by(
                request,
                AuditLevel::Warning,
                "Intento de comando con robot desconectado",
                AuditCode::BadRequest,
            );
            return DEVICE_DISCONNECTED.to_string();
        }

        match core.device.try_send(&line).await {
            Ok(reply) => format!("Peticion procesada: {line} | Arduino: {reply}"),
            Err(err) => {
                self.event_by(
                    request,
                    AuditLevel::Error,
                    format!("Fallo de comunicación enviando {line}: {err}"),
                    AuditCode::ServerError,
                );
                format!("Error de comunicación con el robot: {err}")
            }
        }
    }

    fn record_request(&self, request: &Request<'_>, summary: &str) {
        self.audit.record(AuditEntry::request(
            request.user,
            summary,
            request.id,
            AuditCode::Ok,
        ));
    }

    fn denied(&self, request: &Request<'_>, detail: &str) {
        self.event_by(request, AuditLevel::Warning, detail, AuditCode::BadRequest);
    }

    fn event_by(
        &self,
        request: &Request<'_>,
        level: AuditLevel,
        detail: impl Into<String>,
        code: AuditCode,
    ) {
        self.audit
            .record(AuditEntry::event(level, detail, code, request.id).by(request.user));
    }

    fn event(&self, level: AuditLevel, detail: impl Into<String>, code: AuditCode, id: i64) {
        self.audit.record(AuditEntry::event(level, detail, code, id));
    }
}

fn is_introspection(lowered: &str) -> bool {
    lowered == REPORT || HELP_ALIASES.contains(&lowered)
}

fn view_of(core: &GatewayCore, remote_access: bool) -> DispatcherSnapshot {
    DispatcherSnapshot {
        device_connected: core.device.is_connected(),
        device_port: core.device.port().map(ToOwned::to_owned),
        recording: core.recorder.status(),
        remote_access,
    }
}

/// Value of `key=` in `source`, up to the next space. The key matches in
/// any case; the value keeps the case it was sent in.
fn extract_kv(source: &str, key: &str) -> Option<String> {
    let marker = format!("{}=", key.to_ascii_lowercase());
    let start = source.to_ascii_lowercase().find(&marker)? + marker.len();
    let rest = &source[start..];
    let end = rest.find(' ').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc, time::Duration};

    use protocol::Payload;

    use super::*;
    use crate::{
        audit::{AuditSink, MemoryAuditLog},
        device::{DeviceConfig, DeviceTimings, NO_RESPONSE, SimulatedDevice},
        test_support::unique_temp_dir,
    };

    struct Harness {
        dispatcher: Dispatcher,
        device: SimulatedDevice,
        audit: Arc<MemoryAuditLog>,
        next_id: std::cell::Cell<i64>,
    }

    impl Harness {
        fn new(name: &str) -> Self {
            Self::with_device(name, SimulatedDevice::new())
        }

        fn with_device(name: &str, device: SimulatedDevice) -> Self {
            let config = DeviceConfig {
                port: None,
                baud: 115_200,
                base_timeout: Duration::ZERO,
                timings: DeviceTimings::immediate(),
            };
            let session = DeviceSession::new(config, Arc::new(device.clone()));
            let audit = Arc::new(MemoryAuditLog::new());
            let uploads = UploadStore::new(unique_temp_dir(name));
            Self {
                dispatcher: Dispatcher::new(session, uploads, audit.clone()),
                device,
                audit,
                next_id: std::cell::Cell::new(1),
            }
        }

        async fn send(&self, user: &str, role: Role, text: &str) -> String {
            let id = self.next_id.get();
            self.next_id.set(id + 1);
            let message = Message::new(id, user, "pw", Payload::Text(text.to_string()));
            self.dispatcher.handle(&message, role).await
        }

        async fn admin(&self, text: &str) -> String {
            self.send("root", Role::Admin, text).await
        }

        async fn operator(&self, text: &str) -> String {
            self.send("ana", Role::Operator, text).await
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(self.dispatcher.uploads().root());
        }
    }

    #[tokio::test]
    async fn help_is_always_available() {
        let harness = Harness::new("dispatch-help");
        assert_eq!(harness.operator("ayuda").await, HELP_TEXT);
        harness.admin("admin acceso off").await;
        assert_eq!(harness.operator("?").await, HELP_TEXT);
    }

    #[tokio::test]
    async fn remote_access_gate_blocks_before_translation() {
        let harness = Harness::new("dispatch-gate");
        harness.dispatcher.connect_on_startup().await;

        assert_eq!(
            harness.admin("admin acceso off").await,
            "Acceso remoto: deshabilitado"
        );
        assert_eq!(harness.operator("on").await, REMOTE_ACCESS_DISABLED);
        assert_eq!(harness.operator("bailar").await, REMOTE_ACCESS_DISABLED);
        assert!(harness.device.written_lines().is_empty());

        let report = harness.operator("reporte").await;
        assert!(report.starts_with("4|Servidor||string|----- REPORTE DE USUARIO -----"));

        harness.admin("admin acceso on").await;
        assert_eq!(
            harness.operator("on").await,
            "Peticion procesada: M17 | Arduino: ok"
        );
    }

    #[tokio::test]
    async fn operators_cannot_use_admin_commands() {
        let harness = Harness::new("dispatch-perms");
        assert_eq!(harness.operator("admin acceso off").await, PERMISSION_DENIED);
        assert!(harness.dispatcher.remote_access());
        assert_eq!(harness.operator("admin log 5").await, PERMISSION_DENIED);
        assert!(harness
            .operator("conectar robot")
            .await
            .starts_with("Permiso denegado"));
        assert_eq!(harness.device.open_count(), 0);

        let warnings = harness
            .audit
            .entries_of_kind(AuditKind::Event(AuditLevel::Warning), "ana");
        assert_eq!(warnings.len(), 3);
    }

    #[tokio::test]
    async fn disconnected_device_is_reported_after_translation() {
        let harness = Harness::new("dispatch-home");
        assert_eq!(harness.operator("home").await, DEVICE_DISCONNECTED);
        assert!(harness
            .operator("volar")
            .await
            .starts_with("Error al interpretar la petición: ERR:"));
    }

    #[tokio::test]
    async fn connect_and_disconnect_are_idempotent() {
        let harness = Harness::new("dispatch-connect");
        assert_eq!(
            harness.admin("desconectar robot").await,
            "El robot ya estaba desconectado."
        );
        assert_eq!(
            harness.admin("conectar robot").await,
            "Robot conectado correctamente."
        );
        assert_eq!(
            harness.admin("conectar robot").await,
            "El robot ya estaba conectado."
        );
        assert_eq!(harness.device.open_count(), 1);
        assert_eq!(harness.admin("desconectar robot").await, "Robot desconectado.");
        assert_eq!(
            harness.admin("desconectar robot").await,
            "El robot ya estaba desconectado."
        );
        assert_eq!(harness.device.close_count(), 1);
    }

    #[tokio::test]
    async fn failed_connect_reports_detail() {
        let harness = Harness::with_device("dispatch-noport", SimulatedDevice::new().without_ports());
        let reply = harness.admin("conectar robot").await;
        assert!(reply.starts_with("Error al conectar el robot:"), "{reply}");
        assert!(!harness.dispatcher.snapshot().device_connected);
    }

    #[tokio::test]
    async fn recording_captures_instead_of_executing() {
        let harness = Harness::new("dispatch-record");
        harness.dispatcher.connect_on_startup().await;

        let started = harness.operator("guardar trayectoria=pieza").await;
        assert!(started.starts_with("Grabación iniciada: pieza.gcode."), "{started}");
        assert_eq!(
            harness.operator("encender motores").await,
            "Guardado en pieza.gcode: M17"
        );
        assert!(harness
            .operator("mover brazo")
            .await
            .starts_with("Error al interpretar comando durante grabación"));
        assert_eq!(
            harness.operator("move x=1 y=2").await,
            "Guardado en pieza.gcode: G0 X1 Y2"
        );
        assert!(harness.device.written_lines().is_empty());

        assert_eq!(
            harness.send("bruno", Role::Operator, "guardar trayectoria=otra").await,
            "Ya hay una grabación en curso: pieza.gcode"
        );
        assert_eq!(
            harness.operator("fin trayectoria").await,
            "Grabación finalizada: pieza.gcode. Puede ejecutar con 'run pieza.gcode'"
        );
        assert_eq!(harness.operator("fin trayectoria").await, "No hay grabación activa.");
        assert_eq!(
            harness.dispatcher.uploads().read_lines("pieza.gcode").unwrap(),
            vec!["M17", "G0 X1 Y2"]
        );

        let transcript = harness.operator("run pieza.gcode").await;
        assert!(transcript.starts_with("Ejecucion completada: pieza.gcode (2 lineas)\n"));
        assert_eq!(harness.device.written_lines(), vec!["M17", "G0 X1 Y2"]);
    }

    #[tokio::test]
    async fn recording_name_is_required() {
        let harness = Harness::new("dispatch-record-empty");
        assert_eq!(
            harness.operator("guardar trayectoria=").await,
            "Error: use guardar trayectoria=<nombre>.gcode"
        );
        assert!(!harness.dispatcher.snapshot().recording.active);
    }

    #[tokio::test]
    async fn upload_and_run_produce_a_transcript() {
        let device = SimulatedDevice::new()
            .with_reply("G28", "homed")
            .with_reply("M114", "X:0 Y:0 Z:0");
        let harness = Harness::with_device("dispatch-run", device);

        assert_eq!(
            harness.operator("upload filename=../prog.gcode data=RzI4CgogIE0xMTQgIApNMTcK").await,
            "Archivo subido: prog.gcode"
        );
        assert_eq!(harness.operator("run prog.gcode").await, RUN_DEVICE_DISCONNECTED);
        assert!(harness.dispatcher.uploads().exists("prog.gcode"));

        harness.dispatcher.connect_on_startup().await;
        let transcript = harness.operator("run filename=prog.gcode").await;
        assert_eq!(
            transcript,
            "Ejecucion completada: prog.gcode (3 lineas)\n\
             L1: `G28` -> `homed`\n\
             L2: `M114` -> `X:0 Y:0 Z:0`\n\
             L3: `M17` -> `ok`\n"
        );
    }

    #[tokio::test]
    async fn upload_and_run_errors_are_reported() {
        let harness = Harness::new("dispatch-upload-errors");
        assert!(harness
            .operator("upload filename=a.gcode")
            .await
            .starts_with("Error: formato de upload invalido"));
        assert_eq!(
            harness.operator("upload filename=a.gcode data=@@@").await,
            "Error: base64 invalido."
        );
        assert!(!harness.dispatcher.uploads().exists("a.gcode"));
        assert!(harness
            .operator("run")
            .await
            .starts_with("Error: formato de run invalido"));
        assert!(harness
            .operator("run nada.gcode")
            .await
            .starts_with("Error: archivo no encontrado"));
    }

    #[tokio::test]
    async fn run_continues_past_silent_lines() {
        let device = SimulatedDevice::new().silent().with_reply("M17", "ok");
        let harness = Harness::with_device("dispatch-silent", device);
        harness.dispatcher.connect_on_startup().await;
        harness
            .dispatcher
            .uploads()
            .save("s.gcode", b"G28\nM17\n")
            .unwrap();
        let transcript = harness.operator("run s.gcode").await;
        assert!(transcript.contains(&format!("L1: `G28` -> `{NO_RESPONSE}`")));
        assert!(transcript.contains("L2: `M17` -> `ok`"));
    }

    #[tokio::test]
    async fn report_lists_only_this_users_requests() {
        let device = SimulatedDevice::new().with_reply("M114", "X:5.00 Y:0.00 Z:1.00");
        let harness = Harness::with_device("dispatch-report", device);
        harness.dispatcher.connect_on_startup().await;
        harness.operator("homing").await;
        harness.operator("activar gripper").await;
        harness.send("bruno", Role::Operator, "homing").await;

        let reply = harness.operator("status").await;
        let decoded = Message::deserialize(&reply).unwrap();
        assert_eq!(decoded.user, "Servidor");
        assert_eq!(decoded.credential, "");
        let text = decoded.payload.as_phrase();
        assert!(text.contains("Usuario: ana\n"));
        assert!(text.contains("Cantidad de órdenes ejecutadas: 2\n"));
        assert!(text.contains("Estado del robot: X:5.00 Y:0.00 Z:1.00\n"));
        assert!(text.contains("Conexión activa: Sí\n"));
    }

    #[tokio::test]
    async fn report_without_device_says_disconnected() {
        let harness = Harness::new("dispatch-report-offline");
        let reply = harness.operator("reporte").await;
        let text = Message::deserialize(&reply).unwrap().payload.as_phrase();
        assert!(text.contains("Estado del robot: ROBOT DESCONECTADO\n"));
        assert!(text.contains("Conexión activa: No\n"));
        assert!(text.ends_with("No se registraron peticiones previas."));
    }

    #[tokio::test]
    async fn admin_log_returns_tail() {
        let harness = Harness::new("dispatch-log");
        harness.operator("home").await;
        harness.operator("home").await;
        let tail = harness.admin("admin log 2").await;
        assert_eq!(tail.lines().count(), 2);
        let default_tail = harness.admin("admin log abc").await;
        assert!(default_tail.starts_with("timestamp,tipo"));
    }

    #[test]
    fn extract_kv_stops_at_space() {
        assert_eq!(
            extract_kv("upload filename=a.gcode data=QQ==", "filename").as_deref(),
            Some("a.gcode")
        );
        assert_eq!(
            extract_kv("upload filename=a.gcode data=QQ==", "data").as_deref(),
            Some("QQ==")
        );
        assert_eq!(extract_kv("run a.gcode", "filename"), None);
        assert_eq!(
            extract_kv("UPLOAD FILENAME=Pieza.gcode DATA=QQ==", "filename").as_deref(),
            Some("Pieza.gcode")
        );
        assert_eq!(
            extract_kv("UPLOAD FILENAME=Pieza.gcode DATA=QQ==", "data").as_deref(),
            Some("QQ==")
        );
    }

    #[tokio::test]
    async fn upper_case_upload_and_run_keep_the_value_case() {
        let harness = Harness::new("dispatch-upper");
        assert_eq!(
            harness.operator("UPLOAD FILENAME=Pieza.gcode DATA=RzI4Cg==").await,
            "Archivo subido: Pieza.gcode"
        );
        assert_eq!(
            harness.dispatcher.uploads().read_lines("Pieza.gcode").unwrap(),
            vec!["G28"]
        );

        harness.dispatcher.connect_on_startup().await;
        let transcript = harness.operator("RUN FILENAME=Pieza.gcode").await;
        assert!(
            transcript.starts_with("Ejecucion completada: Pieza.gcode"),
            "{transcript}"
        );
        assert_eq!(harness.device.written_lines(), vec!["G28"]);
    }

    #[tokio::test]
    async fn snapshot_answers_while_a_request_holds_the_core() {
        let harness = Harness::new("dispatch-snapshot");
        harness.dispatcher.connect_on_startup().await;

        let mut busy = harness.dispatcher.core.lock().await;
        busy.device.disconnect();
        let during = harness.dispatcher.snapshot();
        assert!(during.device_connected);
        assert_eq!(during.device_port.as_deref(), Some(SimulatedDevice::PORT));
        drop(busy);

        let after = harness.dispatcher.snapshot();
        assert!(!after.device_connected);
        assert_eq!(after.device_port, None);
    }
}
