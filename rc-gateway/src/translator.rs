use std::{fmt, sync::OnceLock};

use protocol::{
    ABSOLUTE_MODE, GRIPPER_OFF, GRIPPER_ON, HOMING, MOTORS_OFF, MOTORS_ON, MOVE_ARM,
    RELATIVE_MODE, REPORT,
};
use regex::Regex;

/// Prefix shared by every translation failure; no device line starts with it.
pub const ERROR_MARKER: &str = "ERR:";

pub const HOMING_LINE: &str = "G28";
pub const GRIPPER_ON_LINE: &str = "M3";
pub const GRIPPER_OFF_LINE: &str = "M5";
pub const POSITION_QUERY_LINE: &str = "M114";

// Searched in order, first containment match wins. "desactivar gripper"
// contains "activar gripper", so it has to come first.
const PHRASE_TABLE: [(&str, &str); 8] = [
    (MOTORS_ON, "M17"),
    (MOTORS_OFF, "M18"),
    (GRIPPER_OFF, GRIPPER_OFF_LINE),
    (GRIPPER_ON, GRIPPER_ON_LINE),
    (REPORT, POSITION_QUERY_LINE),
    (HOMING, HOMING_LINE),
    (ABSOLUTE_MODE, "G90"),
    (RELATIVE_MODE, "G91"),
];

const EXACT_ALIASES: [(&str, &str); 4] = [
    ("abs", "G90"),
    ("g90", "G90"),
    ("rel", "G91"),
    ("g91", "G91"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    UnknownCommand,
    MissingCoordinates,
    /// The coordinate pattern failed to compile.
    Pattern(String),
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranslateError::UnknownCommand => write!(f, "{ERROR_MARKER} comando desconocido"),
            TranslateError::MissingCoordinates => {
                write!(f, "{ERROR_MARKER} faltan coordenadas en el comando mover brazo")
            }
            TranslateError::Pattern(detail) => {
                write!(f, "{ERROR_MARKER} patron de coordenadas invalido: {detail}")
            }
        }
    }
}

impl std::error::Error for TranslateError {}

/// Maps a command phrase onto a single device-protocol line.
pub fn translate(phrase: &str) -> Result<String, TranslateError> {
    let phrase = phrase.trim().to_lowercase();

    if let Some((_, line)) = EXACT_ALIASES.iter().find(|(alias, _)| *alias == phrase) {
        return Ok((*line).to_string());
    }

    if phrase.contains(MOVE_ARM) {
        return movement_line(&phrase);
    }

    PHRASE_TABLE
        .iter()
        .find(|(key, _)| phrase.contains(key))
        .map(|(_, line)| (*line).to_string())
        .ok_or(TranslateError::UnknownCommand)
}

fn movement_line(phrase: &str) -> Result<String, TranslateError> {
    let pattern = coordinate_pattern()?;
    let mut axes: [Option<&str>; 3] = [None; 3];
    for capture in pattern.captures_iter(phrase) {
        let (Some(axis), Some(value)) = (capture.get(1), capture.get(2)) else {
            continue;
        };
        let slot = match axis.as_str() {
            "x" => 0,
            "y" => 1,
            _ => 2,
        };
        axes[slot].get_or_insert(value.as_str());
    }

    if axes.iter().all(Option::is_none) {
        return Err(TranslateError::MissingCoordinates);
    }

    let mut line = String::from("G0");
    for (label, value) in ['X', 'Y', 'Z'].into_iter().zip(axes) {
        if let Some(value) = value {
            line.push(' ');
            line.push(label);
            line.push_str(value);
        }
    }
    Ok(line)
}

// Accepts `1`, `1.5`, `1.` and `.5`, each optionally negative.
const COORDINATE_PATTERN: &str = r"\b([xyz])\s*=\s*(-?(?:\d+(?:\.\d*)?|\.\d+))";

fn coordinate_pattern() -> Result<&'static Regex, TranslateError> {
    static PATTERN: OnceLock<Result<Regex, TranslateError>> = OnceLock::new();
    PATTERN
        .get_or_init(|| compile_pattern(COORDINATE_PATTERN))
        .as_ref()
        .map_err(Clone::clone)
}

fn compile_pattern(source: &str) -> Result<Regex, TranslateError> {
    Regex::new(source).map_err(|err| TranslateError::Pattern(err.to_string()))
}
