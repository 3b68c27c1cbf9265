use std::{fmt, sync::OnceLock};

use owo_colors::{AnsiColors, OwoColorize};
use supports_color::Stream;
use tracing_subscriber::EnvFilter;

static COLOR_OUTPUT: OnceLock<bool> = OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let colored = *COLOR_OUTPUT.get_or_init(terminal_supports_color);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(colored)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}

/// Subsystem tag printed in front of every gateway log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Access,
    Device,
    Recording,
    Dispatch,
    Audit,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Category::Access => "ACCESS",
            Category::Device => "DEVICE",
            Category::Recording => "RECORDING",
            Category::Dispatch => "DISPATCH",
            Category::Audit => "AUDIT",
        }
    }

    fn palette(self) -> AnsiColors {
        match self {
            Category::Access => AnsiColors::BrightCyan,
            Category::Device => AnsiColors::BrightGreen,
            Category::Recording => AnsiColors::BrightMagenta,
            Category::Dispatch => AnsiColors::BrightYellow,
            Category::Audit => AnsiColors::BrightBlue,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if colored() {
            write!(f, "{}", self.label().color(self.palette()).bold())
        } else {
            f.write_str(self.label())
        }
    }
}

pub fn method_label(method: &str) -> String {
    let color = match method {
        "GET" => AnsiColors::BrightBlue,
        "POST" => AnsiColors::BrightGreen,
        _ => AnsiColors::BrightWhite,
    };
    tint(method, color)
}

pub fn status_label(status: u16) -> String {
    let color = match status / 100 {
        1 => AnsiColors::BrightBlue,
        2 => AnsiColors::BrightGreen,
        3 => AnsiColors::BrightCyan,
        4 => AnsiColors::BrightYellow,
        _ => AnsiColors::BrightRed,
    };
    tint(&status.to_string(), color)
}

fn tint(text: &str, color: AnsiColors) -> String {
    if colored() {
        text.color(color).to_string()
    } else {
        text.to_string()
    }
}

fn colored() -> bool {
    COLOR_OUTPUT.get().copied().unwrap_or(false)
}

fn terminal_supports_color() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    let console_ready = enable_virtual_terminal().is_ok();
    if std::env::var_os("FORCE_COLOR").is_some() {
        return true;
    }
    console_ready || supports_color::on_cached(Stream::Stdout).is_some()
}

#[cfg(windows)]
fn enable_virtual_terminal() -> windows::core::Result<()> {
    use windows::Win32::{
        Foundation::HANDLE,
        System::Console::{
            ENABLE_VIRTUAL_TERMINAL_PROCESSING, GetConsoleMode, GetStdHandle, STD_OUTPUT_HANDLE,
            SetConsoleMode,
        },
    };

    unsafe {
        let stdout = GetStdHandle(STD_OUTPUT_HANDLE)?;
        if stdout == HANDLE::default() {
            return Ok(());
        }
        let mut mode = std::mem::zeroed();
        GetConsoleMode(stdout, &mut mode)?;
        SetConsoleMode(stdout, mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING)
    }
}

#[cfg(not(windows))]
fn enable_virtual_terminal() -> Result<(), ()> {
    Err(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_plain_without_a_subscriber() {
        assert_eq!(Category::Device.to_string(), "DEVICE");
        assert_eq!(Category::Recording.label(), "RECORDING");
        assert_eq!(status_label(200), "200");
        assert_eq!(method_label("POST"), "POST");
    }

    #[test]
    fn categories_have_distinct_palettes() {
        let all = [
            Category::Access,
            Category::Device,
            Category::Recording,
            Category::Dispatch,
            Category::Audit,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(format!("{:?}", a.palette()), format!("{:?}", b.palette()));
            }
        }
        let painted = Category::Audit.label().color(Category::Audit.palette()).to_string();
        assert!(painted.contains("AUDIT"));
    }
}
