use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{debug, error, info, warn};

use crate::logging::Category;

pub const CSV_HEADER: &str = "timestamp,tipo,detalle,usuario,peticion,nodo,codigo";
const COLUMN_COUNT: usize = 7;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Correlation id used for events that are not tied to a request.
pub const NO_CORRELATION: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuditLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditCode {
    Ok = 200,
    BadRequest = 400,
    Unauthorized = 401,
    ServerError = 500,
}

impl AuditCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditKind {
    Event(AuditLevel),
    Request,
    LoginOk,
    LoginFail,
}

impl AuditKind {
    pub fn label(self) -> &'static str {
        match self {
            AuditKind::Event(AuditLevel::Debug) => "EVENTO_DEBUG",
            AuditKind::Event(AuditLevel::Info) => "EVENTO_INFO",
            AuditKind::Event(AuditLevel::Warning) => "EVENTO_WARNING",
            AuditKind::Event(AuditLevel::Error) => "EVENTO_ERROR",
            AuditKind::Request => "PETICION",
            AuditKind::LoginOk => "LOGIN_OK",
            AuditKind::LoginFail => "LOGIN_FAIL",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEntry {
    pub kind: AuditKind,
    pub detail: String,
    pub user: String,
    pub request: String,
    pub correlation_id: i64,
    pub code: AuditCode,
}

impl AuditEntry {
    pub fn event(level: AuditLevel, detail: impl Into<String>, code: AuditCode, id: i64) -> Self {
        Self {
            kind: AuditKind::Event(level),
            detail: detail.into(),
            user: String::new(),
            request: String::new(),
            correlation_id: id,
            code,
        }
    }

    /// Attributes an event to the user whose request caused it.
    pub fn by(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    pub fn request(user: &str, request: &str, id: i64, code: AuditCode) -> Self {
        Self {
            kind: AuditKind::Request,
            detail: "Petición recibida".to_string(),
            user: user.to_string(),
            request: request.to_string(),
            correlation_id: id,
            code,
        }
    }

    pub fn login(user: &str, ok: bool, id: i64) -> Self {
        let (kind, detail, code) = if ok {
            (AuditKind::LoginOk, "Inicio de sesión exitoso", AuditCode::Ok)
        } else {
            (
                AuditKind::LoginFail,
                "Credenciales inválidas",
                AuditCode::Unauthorized,
            )
        };
        Self {
            kind,
            detail: detail.to_string(),
            user: user.to_string(),
            request: String::new(),
            correlation_id: id,
            code,
        }
    }

    fn columns(&self, timestamp: &str) -> [String; COLUMN_COUNT] {
        [
            timestamp.to_string(),
            self.kind.label().to_string(),
            self.detail.clone(),
            self.user.clone(),
            self.request.clone(),
            self.correlation_id.to_string(),
            self.code.as_u16().to_string(),
        ]
    }
}

/// Append-only event sink with a query-by-kind-and-user capability.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);

    /// Raw rows of `kind`; an empty `user` matches every user.
    fn entries_of_kind(&self, kind: AuditKind, user: &str) -> Vec<String>;

    /// The last `count` raw lines held by the sink.
    fn tail(&self, count: usize) -> Vec<String>;
}

pub type SharedAudit = Arc<dyn AuditSink>;

pub struct CsvAuditLog {
    path: PathBuf,
    min_level: AuditLevel,
    file: Mutex<Option<File>>,
}

impl CsvAuditLog {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_min_level(path, AuditLevel::Debug)
    }

    pub fn with_min_level(path: impl Into<PathBuf>, min_level: AuditLevel) -> io::Result<Self> {
        let path = path.into();
        let file = open_for_append(&path)?;
        Ok(Self {
            path,
            min_level,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_contents(&self) -> String {
        match fs::read(&self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                warn!(
                    "{} cannot read {}: {err}",
                    Category::Audit,
                    self.path.display()
                );
                String::new()
            }
        }
    }
}

impl AuditSink for CsvAuditLog {
    fn record(&self, entry: AuditEntry) {
        mirror_to_tracing(&entry);
        if !accepts(self.min_level, entry.kind) {
            return;
        }

        let row = match format_row(entry.columns(&timestamp_now())) {
            Ok(row) => row,
            Err(err) => {
                error!("{} cannot encode audit row: {err}", Category::Audit);
                return;
            }
        };
        let mut guard = self.lock();
        if guard.is_none() {
            match open_for_append(&self.path) {
                Ok(file) => *guard = Some(file),
                Err(err) => {
                    error!(
                        "{} cannot reopen {}: {err}",
                        Category::Audit,
                        self.path.display()
                    );
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut()
            && let Err(err) = writeln!(file, "{row}").and_then(|_| file.flush())
        {
            error!(
                "{} failed to append to {}: {err}",
                Category::Audit,
                self.path.display()
            );
            *guard = None;
        }
    }

    fn entries_of_kind(&self, kind: AuditKind, user: &str) -> Vec<String> {
        let _guard = self.lock();
        let contents = self.read_contents();
        matching_rows(&contents, true, kind, user)
    }

    fn tail(&self, count: usize) -> Vec<String> {
        let _guard = self.lock();
        let contents = self.read_contents();
        last_lines(contents.lines().map(ToOwned::to_owned).collect(), count)
    }
}

/// In-memory sink with the same filtering and query semantics as the CSV log.
pub struct MemoryAuditLog {
    min_level: AuditLevel,
    rows: Mutex<Vec<String>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self {
            min_level: AuditLevel::Debug,
            rows: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for MemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, entry: AuditEntry) {
        mirror_to_tracing(&entry);
        if !accepts(self.min_level, entry.kind) {
            return;
        }
        let row = match format_row(entry.columns(&timestamp_now())) {
            Ok(row) => row,
            Err(err) => {
                error!("{} cannot encode audit row: {err}", Category::Audit);
                return;
            }
        };
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(row);
    }

    fn entries_of_kind(&self, kind: AuditKind, user: &str) -> Vec<String> {
        matching_rows(&self.entries().join("\n"), false, kind, user)
    }

    fn tail(&self, count: usize) -> Vec<String> {
        let mut lines = vec![CSV_HEADER.to_string()];
        for row in self.entries() {
            lines.extend(row.lines().map(ToOwned::to_owned));
        }
        last_lines(lines, count)
    }
}

fn accepts(min_level: AuditLevel, kind: AuditKind) -> bool {
    match kind {
        AuditKind::Event(level) => level >= min_level,
        _ => true,
    }
}

fn mirror_to_tracing(entry: &AuditEntry) {
    let label = Category::Audit;
    match entry.kind {
        AuditKind::Event(AuditLevel::Debug) => debug!(
            "{label} {} id={} code={}",
            entry.detail,
            entry.correlation_id,
            entry.code.as_u16()
        ),
        AuditKind::Event(AuditLevel::Info) => info!(
            "{label} {} id={} code={}",
            entry.detail,
            entry.correlation_id,
            entry.code.as_u16()
        ),
        AuditKind::Event(AuditLevel::Warning) => warn!(
            "{label} {} id={} code={}",
            entry.detail,
            entry.correlation_id,
            entry.code.as_u16()
        ),
        AuditKind::Event(AuditLevel::Error) => error!(
            "{label} {} id={} code={}",
            entry.detail,
            entry.correlation_id,
            entry.code.as_u16()
        ),
        AuditKind::Request | AuditKind::LoginOk | AuditKind::LoginFail => info!(
            "{label} {} user={} request={:?} id={} code={}",
            entry.kind,
            entry.user,
            entry.request,
            entry.correlation_id,
            entry.code.as_u16()
        ),
    }
}

fn open_for_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if file.metadata()?.len() == 0 {
        writeln!(file, "{CSV_HEADER}")?;
        file.flush()?;
    }
    Ok(file)
}

fn timestamp_now() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Encodes one record, quoting only the fields that need it. The row
/// carries no terminator.
fn format_row<I, T>(fields: I) -> csv::Result<String>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .quote_style(csv::QuoteStyle::Necessary)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    let bytes = writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))?;
    let row = String::from_utf8_lossy(&bytes);
    Ok(row.strip_suffix('\n').unwrap_or(&row).to_string())
}

/// Rows of `kind` written by `user` (any user when empty). Records with
/// fewer than seven fields or that fail to parse are skipped.
fn matching_rows(contents: &str, has_headers: bool, kind: AuditKind, user: &str) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .from_reader(contents.as_bytes());
    reader
        .records()
        .filter_map(Result::ok)
        .filter(|record| {
            record.len() >= COLUMN_COUNT
                && record.get(1) == Some(kind.label())
                && (user.is_empty() || record.get(3) == Some(user))
        })
        .filter_map(|record| format_row(&record).ok())
        .collect()
}

fn last_lines(lines: Vec<String>, count: usize) -> Vec<String> {
    let skip = lines.len().saturating_sub(count);
    lines.into_iter().skip(skip).collect()
}
