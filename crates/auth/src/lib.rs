//! vitalink-auth – Auth-Gate
//!
//! Dieses Crate implementiert:
//! - Extraktion des Bearer-Tokens aus Header oder Handshake-Query
//! - JWT-Pruefung (HS256, Signatur und Ablauf) gegen ein gemeinsames Secret
//! - Identitaet (`userId`, `role`, `email`) fuer die Verbindung
//!
//! Das Gate schreibt keinen Zustand: es liefert nur Erlauben (mit
//! Identitaet) oder Ablehnen (mit unterscheidbarem Grund).

pub mod error;
pub mod jwt;
pub mod token;

// Bequeme Re-Exporte
pub use error::{AuthError, AuthResult};
pub use jwt::{Identitaet, JwtPruefer, TokenClaims};
pub use token::token_extrahieren;
