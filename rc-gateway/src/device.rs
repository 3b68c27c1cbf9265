use std::{
    collections::HashMap,
    fmt, fs,
    io::{self, Read, Write},
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::{
    logging::Category,
    translator::{GRIPPER_OFF_LINE, GRIPPER_ON_LINE, HOMING_LINE},
};

/// Returned by [`DeviceSession::send`] when no port is open.
pub const NOT_CONNECTED: &str = "ERROR: No conectado al Arduino.";
/// Returned by [`DeviceSession::send`] when the window closed without a byte.
pub const NO_RESPONSE: &str = "SIN RESPUESTA";

const LINE_TERMINATOR: &[u8] = b"\r\n";
const DISCOVERY_DIR: &str = "/dev";
const DISCOVERY_PREFIXES: [&str; 2] = ["ttyUSB", "ttyACM"];
const READ_CHUNK: usize = 256;
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceTimings {
    pub open_attempts: u32,
    pub open_backoff: Duration,
    pub boot_settle: Duration,
    pub configure_settle: Duration,
    pub write_settle: Duration,
    pub poll_interval: Duration,
    pub homing_window: Duration,
    pub gripper_window: Duration,
    pub line_pacing: Duration,
}

impl Default for DeviceTimings {
    fn default() -> Self {
        Self {
            open_attempts: 3,
            open_backoff: Duration::from_secs(2),
            boot_settle: Duration::from_secs(5),
            configure_settle: Duration::from_secs(1),
            write_settle: Duration::from_millis(150),
            poll_interval: Duration::from_millis(50),
            homing_window: Duration::from_millis(5000),
            gripper_window: Duration::from_millis(2000),
            line_pacing: Duration::from_millis(100),
        }
    }
}

impl DeviceTimings {
    /// No delays at all; a single read pass per exchange.
    pub fn immediate() -> Self {
        Self {
            open_attempts: 3,
            open_backoff: Duration::ZERO,
            boot_settle: Duration::ZERO,
            configure_settle: Duration::ZERO,
            write_settle: Duration::ZERO,
            poll_interval: Duration::ZERO,
            homing_window: Duration::ZERO,
            gripper_window: Duration::ZERO,
            line_pacing: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub port: Option<String>,
    pub baud: u32,
    pub base_timeout: Duration,
    pub timings: DeviceTimings,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: 115_200,
            base_timeout: Duration::from_millis(1000),
            timings: DeviceTimings::default(),
        }
    }
}

#[derive(Debug)]
pub enum DeviceError {
    NoPortFound,
    Open { port: String, source: io::Error },
    Configure { port: String, source: io::Error },
    Io(io::Error),
    NotConnected,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NoPortFound => write!(f, "no se detectaron puertos serie disponibles"),
            DeviceError::Open { port, source } => {
                write!(f, "no se pudo abrir el puerto {port}: {source}")
            }
            DeviceError::Configure { port, source } => {
                write!(f, "no se pudo configurar el puerto {port}: {source}")
            }
            DeviceError::Io(err) => write!(f, "error de E/S serie: {err}"),
            DeviceError::NotConnected => f.write_str(NOT_CONNECTED),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::Open { source, .. } | DeviceError::Configure { source, .. } => {
                Some(source)
            }
            DeviceError::Io(err) => Some(err),
            DeviceError::NoPortFound | DeviceError::NotConnected => None,
        }
    }
}

/// An open, configured byte link to the device.
pub trait SerialLink: Send {
    fn discard_input(&mut self) -> io::Result<()>;
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn bytes_available(&mut self) -> io::Result<usize>;
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Finds and opens device ports.
pub trait PortOpener: Send + Sync {
    fn discover(&self) -> Vec<String>;
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialLink>, DeviceError>;
}

/// Real serial ports, opened raw 8-N-1 with no flow control.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn discover(&self) -> Vec<String> {
        discover_ports_in(Path::new(DISCOVERY_DIR))
    }

    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialLink>, DeviceError> {
        let handle = serialport::new(port, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(PORT_READ_TIMEOUT)
            .open()
            .map_err(|err| DeviceError::Open {
                port: port.to_string(),
                source: err.into(),
            })?;
        Ok(Box::new(SystemLink { port: handle }))
    }
}

struct SystemLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink for SystemLink {
    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::All).map_err(io::Error::from)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.port, bytes)?;
        self.port.flush()
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let pending = self.port.bytes_to_read().map_err(io::Error::from)?;
        Ok(pending as usize)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(read) => Ok(read),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err),
        }
    }
}

/// Device candidates under `dir`: `ttyUSB*` first, then `ttyACM*`, each sorted.
pub fn discover_ports_in(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str().map(ToOwned::to_owned))
        .collect();

    let mut found = Vec::new();
    for prefix in DISCOVERY_PREFIXES {
        let mut group: Vec<&String> = names
            .iter()
            .filter(|name| name.starts_with(prefix))
            .collect();
        group.sort();
        found.extend(
            group
                .into_iter()
                .map(|name| dir.join(name).to_string_lossy().into_owned()),
        );
    }
    found
}

/// The single serial connection to the device. Callers serialise access.
pub struct DeviceSession {
    config: DeviceConfig,
    opener: Arc<dyn PortOpener>,
    link: Option<SharedLink>,
    active_port: Option<String>,
}

impl DeviceSession {
    pub fn new(config: DeviceConfig, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            config,
            opener,
            link: None,
            active_port: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn port(&self) -> Option<&str> {
        self.active_port.as_deref()
    }

    pub fn timings(&self) -> &DeviceTimings {
        &self.config.timings
    }

    /// Opens the device, replacing any link already held. Without an
    /// explicit port the configured one is used, else the first discovered.
    pub async fn connect(&mut self, explicit: Option<&str>) -> Result<String, DeviceError> {
        if self.link.take().is_some() {
            info!(
                "{} closing {} before reconnecting",
                Category::Device,
                self.active_port.as_deref().unwrap_or("?")
            );
        }
        self.active_port = None;

        let port = match explicit.or(self.config.port.as_deref()) {
            Some(port) => port.to_string(),
            None => {
                let found = self.opener.discover();
                let Some(first) = found.into_iter().next() else {
                    warn!("{} no serial ports detected", Category::Device);
                    return Err(DeviceError::NoPortFound);
                };
                info!("{} detected port {first}", Category::Device);
                first
            }
        };

        let timings = self.config.timings;
        let attempts = timings.open_attempts.max(1);
        let mut opened = None;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match open_port(Arc::clone(&self.opener), &port, self.config.baud).await {
                Ok(link) => {
                    opened = Some(link);
                    break;
                }
                Err(err) => {
                    warn!(
                        "{} open attempt {attempt}/{attempts} on {port} failed: {err}",
                        Category::Device
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        sleep(timings.open_backoff).await;
                    }
                }
            }
        }
        let Some(link) = opened else {
            return Err(last_error.unwrap_or(DeviceError::NoPortFound));
        };
        let link: SharedLink = Arc::new(Mutex::new(link));

        info!("{} waiting for device boot on {port}", Category::Device);
        sleep(timings.boot_settle).await;
        on_blocking_thread(&link, |link| link.discard_input())
            .await
            .map_err(|source| DeviceError::Configure {
                port: port.clone(),
                source,
            })?;
        sleep(timings.configure_settle).await;

        info!(
            "{} connected to {port} at {} baud",
            Category::Device,
            self.config.baud
        );
        self.link = Some(link);
        self.active_port = Some(port.clone());
        Ok(port)
    }

    /// Releases the port. Returns whether a link was actually held.
    pub fn disconnect(&mut self) -> bool {
        let port = self.active_port.take();
        if self.link.take().is_some() {
            info!(
                "{} closed {}",
                Category::Device,
                port.as_deref().unwrap_or("?")
            );
            true
        } else {
            false
        }
    }

    /// How long to listen for a reply to `line`.
    pub fn response_window(&self, line: &str) -> Duration {
        let timings = &self.config.timings;
        match line.split_whitespace().next() {
            Some(HOMING_LINE) => timings.homing_window,
            Some(GRIPPER_ON_LINE | GRIPPER_OFF_LINE) => timings.gripper_window,
            _ => self.config.base_timeout,
        }
    }

    /// Sends one line and collects the reply. An I/O failure drops the link
    /// so the session never claims a connection it no longer has.
    pub async fn try_send(&mut self, line: &str) -> Result<String, DeviceError> {
        let window = self.response_window(line);
        let timings = self.config.timings;
        let Some(link) = self.link.clone() else {
            return Err(DeviceError::NotConnected);
        };

        match exchange(link, line, &timings, window).await {
            Ok(reply) => {
                debug!("{} {line} -> {reply}", Category::Device);
                Ok(reply)
            }
            Err(err) => {
                warn!(
                    "{} exchange of {line} failed, dropping link: {err}",
                    Category::Device
                );
                self.link = None;
                self.active_port = None;
                Err(DeviceError::Io(err))
            }
        }
    }

    /// Like [`Self::try_send`] but folds failures into sentinel strings.
    pub async fn send(&mut self, line: &str) -> String {
        match self.try_send(line).await {
            Ok(reply) => reply,
            Err(DeviceError::NotConnected) => NOT_CONNECTED.to_string(),
            Err(err) => format!("ERROR: {err}"),
        }
    }
}

async fn open_port(
    opener: Arc<dyn PortOpener>,
    port: &str,
    baud: u32,
) -> Result<Box<dyn SerialLink>, DeviceError> {
    let path = port.to_string();
    tokio::task::spawn_blocking(move || opener.open(&path, baud))
        .await
        .map_err(|err| DeviceError::Open {
            port: port.to_string(),
            source: io::Error::other(err.to_string()),
        })?
}

type SharedLink = Arc<Mutex<Box<dyn SerialLink>>>;

/// Runs one burst of link I/O on the blocking pool so a slow port never
/// stalls the runtime's worker threads.
async fn on_blocking_thread<T, F>(link: &SharedLink, op: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn SerialLink) -> io::Result<T> + Send + 'static,
{
    let link = Arc::clone(link);
    tokio::task::spawn_blocking(move || {
        let mut guard = link.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        op(guard.as_mut())
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

async fn exchange(
    link: SharedLink,
    line: &str,
    timings: &DeviceTimings,
    window: Duration,
) -> io::Result<String> {
    let mut payload = Vec::with_capacity(line.len() + LINE_TERMINATOR.len());
    payload.extend_from_slice(line.as_bytes());
    payload.extend_from_slice(LINE_TERMINATOR);
    on_blocking_thread(&link, move |link| {
        link.discard_input()?;
        link.write_all(&payload)
    })
    .await?;

    sleep(timings.write_settle).await;

    let deadline = Instant::now() + window;
    let mut buffer = Vec::new();
    loop {
        let chunk = on_blocking_thread(&link, |link| {
            if link.bytes_available()? == 0 {
                return Ok(Vec::new());
            }
            let mut chunk = [0u8; READ_CHUNK];
            let read = link.read_available(&mut chunk)?;
            Ok(chunk[..read].to_vec())
        })
        .await?;
        buffer.extend_from_slice(&chunk);
        if Instant::now() >= deadline {
            break;
        }
        sleep(timings.poll_interval).await;
    }

    if buffer.is_empty() {
        return Ok(NO_RESPONSE.to_string());
    }
    let text = String::from_utf8_lossy(&buffer);
    Ok(text.trim_end_matches(['\r', '\n']).to_string())
}

/// In-process stand-in for the device: answers each written line from a
/// script and records everything it was sent.
#[derive(Clone, Default)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimulatedState>>,
}

#[derive(Default)]
struct SimulatedState {
    ports: Vec<String>,
    replies: HashMap<String, String>,
    default_reply: Option<String>,
    written: Vec<String>,
    opens: usize,
    closes: usize,
    failing_opens: u32,
}

impl SimulatedDevice {
    pub const PORT: &'static str = "/dev/ttySIM0";

    pub fn new() -> Self {
        let device = Self::default();
        {
            let mut state = device.lock();
            state.ports.push(Self::PORT.to_string());
            state.default_reply = Some("ok".to_string());
        }
        device
    }

    pub fn with_reply(self, line: &str, reply: &str) -> Self {
        self.lock()
            .replies
            .insert(line.to_string(), reply.to_string());
        self
    }

    /// Lines without a scripted reply get no answer at all.
    pub fn silent(self) -> Self {
        self.lock().default_reply = None;
        self
    }

    pub fn without_ports(self) -> Self {
        self.lock().ports.clear();
        self
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PortOpener for SimulatedDevice {
    fn discover(&self) -> Vec<String> {
        self.lock().ports.clone()
    }

    fn open(&self, port: &str, _baud: u32) -> Result<Box<dyn SerialLink>, DeviceError> {
        let mut state = self.lock();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(DeviceError::Open {
                port: port.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "simulated open failure"),
            });
        }
        state.opens += 1;
        Ok(Box::new(SimulatedLink {
            device: self.clone(),
            pending: Vec::new(),
        }))
    }
}

struct SimulatedLink {
    device: SimulatedDevice,
    pending: Vec<u8>,
}

impl SerialLink for SimulatedLink {
    fn discard_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(bytes);
        let line = text.trim_end_matches(['\r', '\n']).to_string();
        let mut state = self.device.lock();
        let reply = state
            .replies
            .get(&line)
            .cloned()
            .or_else(|| state.default_reply.clone());
        state.written.push(line);
        if let Some(reply) = reply {
            self.pending.extend_from_slice(reply.as_bytes());
            self.pending.extend_from_slice(LINE_TERMINATOR);
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.pending.len())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len().min(self.pending.len());
        buf[..count].copy_from_slice(&self.pending[..count]);
        self.pending.drain(..count);
        Ok(count)
    }
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        self.device.lock().closes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unique_temp_dir;

    fn session(device: &SimulatedDevice) -> DeviceSession {
        let config = DeviceConfig {
            port: None,
            baud: 115_200,
            base_timeout: Duration::ZERO,
            timings: DeviceTimings::immediate(),
        };
        DeviceSession::new(config, Arc::new(device.clone()))
    }

    struct SluggishPorts;

    struct SluggishLink;

    impl PortOpener for SluggishPorts {
        fn discover(&self) -> Vec<String> {
            vec!["/dev/ttySLOW0".to_string()]
        }

        fn open(&self, _port: &str, _baud: u32) -> Result<Box<dyn SerialLink>, DeviceError> {
            Ok(Box::new(SluggishLink))
        }
    }

    impl SerialLink for SluggishLink {
        fn discard_input(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn write_all(&mut self, _bytes: &[u8]) -> io::Result<()> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        }

        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(2)
        }

        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            buf[..2].copy_from_slice(b"ok");
            Ok(2)
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn slow_port_writes_leave_the_runtime_free() {
        let config = DeviceConfig {
            port: None,
            baud: 115_200,
            base_timeout: Duration::ZERO,
            timings: DeviceTimings::immediate(),
        };
        let mut session = DeviceSession::new(config, Arc::new(SluggishPorts));
        session.connect(None).await.unwrap();

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                sleep(Duration::from_millis(10)).await;
            }
        });

        assert_eq!(session.send("G28").await, "ok");
        ticker.abort();
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 5);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn send_without_connection_returns_sentinel() {
        let device = SimulatedDevice::new();
        let mut session = session(&device);
        assert_eq!(session.send("G28").await, NOT_CONNECTED);
        assert!(matches!(
            session.try_send("G28").await,
            Err(DeviceError::NotConnected)
        ));
        assert!(device.written_lines().is_empty());
    }

    #[tokio::test]
    async fn connect_discovers_port_and_exchanges_lines() {
        let device = SimulatedDevice::new().with_reply("M114", "X:1.00 Y:2.00 Z:0.00");
        let mut session = session(&device);
        let port = session.connect(None).await.unwrap();
        assert_eq!(port, SimulatedDevice::PORT);
        assert_eq!(session.port(), Some(SimulatedDevice::PORT));
        assert_eq!(session.send("M114").await, "X:1.00 Y:2.00 Z:0.00");
        assert_eq!(session.send("M17").await, "ok");
        assert_eq!(device.written_lines(), vec!["M114", "M17"]);
    }

    #[tokio::test]
    async fn silence_is_distinct_from_an_empty_line() {
        let device = SimulatedDevice::new().silent().with_reply("M18", "");
        let mut session = session(&device);
        session.connect(None).await.unwrap();
        assert_eq!(session.send("G28").await, NO_RESPONSE);
        assert_eq!(session.send("M18").await, "");
    }

    #[tokio::test]
    async fn no_discovered_port_fails() {
        let device = SimulatedDevice::new().without_ports();
        let mut session = session(&device);
        assert!(matches!(
            session.connect(None).await,
            Err(DeviceError::NoPortFound)
        ));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn open_is_retried_until_attempts_run_out() {
        let device = SimulatedDevice::new();
        let mut session = session(&device);

        device.fail_next_opens(2);
        session.connect(Some("/dev/ttyUSB3")).await.unwrap();
        assert_eq!(session.port(), Some("/dev/ttyUSB3"));
        session.disconnect();

        device.fail_next_opens(3);
        let err = session.connect(None).await.unwrap_err();
        assert!(matches!(err, DeviceError::Open { .. }));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn reconnect_closes_previous_link_and_disconnect_is_idempotent() {
        let device = SimulatedDevice::new();
        let mut session = session(&device);
        session.connect(None).await.unwrap();
        session.connect(None).await.unwrap();
        assert_eq!(device.open_count(), 2);
        assert_eq!(device.close_count(), 1);

        assert!(session.disconnect());
        assert!(!session.disconnect());
        assert_eq!(device.close_count(), 2);
    }

    #[test]
    fn response_window_depends_on_command() {
        let device = SimulatedDevice::new();
        let config = DeviceConfig::default();
        let session = DeviceSession::new(config, Arc::new(device));
        assert_eq!(session.response_window("G28"), Duration::from_millis(5000));
        assert_eq!(session.response_window("M3"), Duration::from_millis(2000));
        assert_eq!(session.response_window("M5"), Duration::from_millis(2000));
        assert_eq!(session.response_window("G0 X1"), Duration::from_millis(1000));
        assert_eq!(session.response_window("M30"), Duration::from_millis(1000));
    }

    #[test]
    fn discovery_lists_usb_before_acm() {
        let dir = unique_temp_dir("device-discovery");
        fs::create_dir_all(&dir).unwrap();
        for name in ["ttyACM0", "ttyUSB1", "ttyUSB0", "ttyS0", "null"] {
            fs::write(dir.join(name), b"").unwrap();
        }
        let found = discover_ports_in(&dir);
        let names: Vec<String> = found
            .iter()
            .map(|path| Path::new(path).file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["ttyUSB0", "ttyUSB1", "ttyACM0"]);
        let _ = fs::remove_dir_all(&dir);
    }
}
