//! Fehlertypen fuer das Auth-Gate

use thiserror::Error;

/// Alle Gruende, aus denen ein Verbindungsaufbau abgelehnt wird
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Kein Token uebermittelt")]
    TokenFehlt,

    /// Token ist kein wohlgeformtes JWT oder die Claims fehlen
    #[error("Token ungueltig: {0}")]
    TokenUngueltig(String),

    #[error("Token abgelaufen")]
    TokenAbgelaufen,

    /// Signatur oder Algorithmus passen nicht
    #[error("Token-Pruefung fehlgeschlagen: {0}")]
    VerifizierungFehlgeschlagen(String),
}

impl AuthError {
    /// Client-sichtbarer Ablehnungsgrund
    pub fn grund(&self) -> &'static str {
        match self {
            Self::TokenFehlt => "No token provided",
            Self::TokenUngueltig(_) => "Invalid token",
            Self::TokenAbgelaufen => "Token expired",
            Self::VerifizierungFehlgeschlagen(_) => "Token verification failed",
        }
    }
}

/// Result-Alias fuer das Auth-Gate
pub type AuthResult<T> = Result<T, AuthError>;
