mod audit;
mod credentials;
mod device;
mod dispatcher;
mod logging;
mod recording;
mod report;
mod runtime;
mod translator;
mod uploads;

pub use audit::{
    AuditCode, AuditEntry, AuditKind, AuditLevel, AuditSink, CSV_HEADER, CsvAuditLog,
    MemoryAuditLog, NO_CORRELATION, SharedAudit,
};
pub use credentials::{
    CredentialError, CredentialStore, FileCredentialStore, Role, SharedCredentials,
    StaticCredentials, UserRecord,
};
pub use device::{
    DeviceConfig, DeviceError, DeviceSession, DeviceTimings, NO_RESPONSE, NOT_CONNECTED,
    PortOpener, SerialLink, SimulatedDevice, SystemPorts, discover_ports_in,
};
pub use dispatcher::{DEFAULT_LOG_LINES, Dispatcher, DispatcherSnapshot, GatewayCore, HELP_TEXT};
pub use logging::init as init_logging;
pub use recording::{DEFAULT_EXTENSION, Recorder, RecordingError, RecordingStatus};
pub use report::{DISCONNECTED_STATUS, NO_PRIOR_REQUESTS, UNKNOWN_STATUS, UserReport};
pub use runtime::{ENVELOPE_ERROR, HealthStatus, INVALID_CREDENTIALS, SharedState, build_rpc_app};
pub use translator::{ERROR_MARKER, TranslateError, translate};
pub use uploads::{StoreError, UploadStore, sanitize_name};

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicU64, Ordering},
        time::{SystemTime, UNIX_EPOCH},
    };

    static TEST_DIR_SEQUENCE: AtomicU64 = AtomicU64::new(0);

    pub fn unique_temp_dir(test_name: &str) -> PathBuf {
        let seq = TEST_DIR_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "rc-gateway-{test_name}-{}-{now}-{seq}",
            std::process::id()
        ))
    }
}
