use std::fmt::Write;

pub const UNKNOWN_STATUS: &str = "Desconocido";
pub const DISCONNECTED_STATUS: &str = "ROBOT DESCONECTADO";
pub const NO_PRIOR_REQUESTS: &str = "No se registraron peticiones previas.";

/// Per-user summary returned by the `reporte` command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserReport {
    pub user: String,
    pub requests: Vec<String>,
    pub device_status: String,
    pub connected: bool,
}

impl UserReport {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            requests: Vec::new(),
            device_status: UNKNOWN_STATUS.to_string(),
            connected: false,
        }
    }

    pub fn with_requests(mut self, requests: Vec<String>) -> Self {
        self.requests = requests;
        self
    }

    pub fn with_device(mut self, connected: bool, status: impl Into<String>) -> Self {
        self.connected = connected;
        self.device_status = status.into();
        self
    }

    pub fn render(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "----- REPORTE DE USUARIO -----");
        let _ = writeln!(text, "Usuario: {}", self.user);
        let _ = writeln!(text, "Cantidad de órdenes ejecutadas: {}", self.requests.len());
        let _ = writeln!(text, "Estado del robot: {}", self.device_status);
        let _ = writeln!(
            text,
            "Conexión activa: {}",
            if self.connected { "Sí" } else { "No" }
        );
        let _ = writeln!(text, "--------------------------------");
        let _ = writeln!(text, "Órdenes ejecutadas:");
        if self.requests.is_empty() {
            text.push_str(NO_PRIOR_REQUESTS);
        } else {
            for line in &self.requests {
                let _ = writeln!(text, "{line}");
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_uses_fixed_layout() {
        let text = UserReport::new("ana").render();
        assert_eq!(
            text,
            "----- REPORTE DE USUARIO -----\n\
             Usuario: ana\n\
             Cantidad de órdenes ejecutadas: 0\n\
             Estado del robot: Desconocido\n\
             Conexión activa: No\n\
             --------------------------------\n\
             Órdenes ejecutadas:\n\
             No se registraron peticiones previas."
        );
    }

    #[test]
    fn requests_are_counted_and_listed() {
        let text = UserReport::new("ana")
            .with_requests(vec!["row one".to_string(), "row two".to_string()])
            .with_device(true, "X:0.00 Y:0.00 Z:0.00")
            .render();
        assert!(text.contains("Cantidad de órdenes ejecutadas: 2\n"));
        assert!(text.contains("Estado del robot: X:0.00 Y:0.00 Z:0.00\n"));
        assert!(text.contains("Conexión activa: Sí\n"));
        assert!(text.ends_with("Órdenes ejecutadas:\nrow one\nrow two\n"));
    }
}
