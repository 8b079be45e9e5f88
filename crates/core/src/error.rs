//! Fehlertypen fuer vitalink-core
//!
//! Untermodule anderer Crates definieren eigene Fehler und konvertieren
//! bei Bedarf via `#[from]`.

use thiserror::Error;

/// Result-Alias fuer vitalink-core
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Fehler beim Umgang mit gemeinsamen Typen und Cluster-Events
#[derive(Debug, Error)]
pub enum CoreError {
    /// Cluster-Event konnte nicht (de)serialisiert werden
    #[error("Serialisierungsfehler: {0}")]
    Serialisierung(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehler_anzeige() {
        let e: CoreError = serde_json::from_str::<u32>("x").unwrap_err().into();
        assert!(e.to_string().starts_with("Serialisierungsfehler"));
    }
}
