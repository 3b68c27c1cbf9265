//! Canonical command phrases shared by the gateway and its clients.
//!
//! The gateway's translator matches against these exact strings, and
//! [`normalize`] maps console shorthands onto them, so both sides stay in
//! agreement about what a phrase means.

pub const MOTORS_ON: &str = "encender motores";
pub const MOTORS_OFF: &str = "apagar motores";
pub const GRIPPER_ON: &str = "activar gripper";
pub const GRIPPER_OFF: &str = "desactivar gripper";
pub const REPORT: &str = "reporte";
pub const HOMING: &str = "homing";
pub const ABSOLUTE_MODE: &str = "modo absoluto";
pub const RELATIVE_MODE: &str = "modo relativo";
pub const MOVE_ARM: &str = "mover brazo";

pub const HELP: &str = "comandos";
pub const HELP_ALIASES: [&str; 3] = ["comandos", "ayuda", "help"];
pub const CONNECT_DEVICE: &str = "conectar robot";
pub const DISCONNECT_DEVICE: &str = "desconectar robot";
pub const START_RECORDING: &str = "guardar trayectoria";
pub const FINISH_RECORDING: &str = "fin trayectoria";

/// Every device phrase the translator accepts, in catalogue order.
pub const CATALOGUE: [&str; 9] = [
    MOTORS_ON,
    MOTORS_OFF,
    GRIPPER_ON,
    GRIPPER_OFF,
    REPORT,
    HOMING,
    ABSOLUTE_MODE,
    RELATIVE_MODE,
    MOVE_ARM,
];

const ALIASES: [(&str, &str); 14] = [
    ("on", MOTORS_ON),
    ("off", MOTORS_OFF),
    ("home", HOMING),
    ("rep", REPORT),
    ("status", REPORT),
    ("grip on", GRIPPER_ON),
    ("grip off", GRIPPER_OFF),
    ("abs", ABSOLUTE_MODE),
    ("g90", ABSOLUTE_MODE),
    ("rel", RELATIVE_MODE),
    ("g91", RELATIVE_MODE),
    ("?", HELP),
    ("help", HELP),
    ("ayuda", HELP),
];

const MOVE_SHORTHAND: &str = "move";
const AXES: [char; 3] = ['x', 'y', 'z'];

/// Maps a shorthand command onto its canonical phrase.
///
/// Inputs that are not a known shorthand are returned trimmed but otherwise
/// untouched, so file names and base64 blobs keep their case.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let lowered = trimmed.to_lowercase();

    if let Some((_, canonical)) = ALIASES.iter().find(|(alias, _)| *alias == lowered) {
        return (*canonical).to_string();
    }

    if let Some(rest) = lowered.strip_prefix(MOVE_SHORTHAND)
        && (rest.is_empty() || rest.starts_with(char::is_whitespace))
    {
        return expand_move(rest);
    }

    trimmed.to_string()
}

fn expand_move(arguments: &str) -> String {
    let mut phrase = MOVE_ARM.to_string();
    for axis in AXES {
        if let Some(value) = axis_value(arguments, axis) {
            phrase.push(' ');
            phrase.push(axis);
            phrase.push('=');
            phrase.push_str(value);
        }
    }
    phrase
}

fn axis_value(arguments: &str, axis: char) -> Option<&str> {
    let mut search = arguments;
    while let Some(index) = search.find(axis) {
        let after = search[index + axis.len_utf8()..].trim_start();
        if let Some(value) = after.strip_prefix('=') {
            let value = value.trim_start();
            let end = value
                .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == '.'))
                .unwrap_or(value.len());
            if end > 0 {
                return Some(&value[..end]);
            }
        }
        search = &search[index + axis.len_utf8()..];
    }
    None
}
