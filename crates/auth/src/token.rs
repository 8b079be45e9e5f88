//! Token-Extraktion aus der Upgrade-Anfrage
//!
//! Reihenfolge:
//! 1. `Authorization: Bearer <token>`
//! 2. Handshake-Feld `?token=<token>` in der Query
//!
//! Die Query wird vom Aufrufer dekodiert (axum `Query`), hier kommt nur
//! noch der Wert an.

use crate::error::{AuthError, AuthResult};

/// Waehlt den Bearer-Token aus Authorization-Header oder Query-Feld
pub fn token_extrahieren(authorization: Option<&str>, query_token: Option<&str>) -> AuthResult<String> {
    if let Some(token) = authorization
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Ok(token.to_string());
    }

    query_token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or(AuthError::TokenFehlt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_aus_header() {
        let token = token_extrahieren(Some("Bearer abc.def.ghi"), None).unwrap();
        assert_eq!(token, "abc.def.ghi");
    }

    #[test]
    fn token_aus_query() {
        let token = token_extrahieren(None, Some("abc.def.ghi")).unwrap();
        assert_eq!(token, "abc.def.ghi");
    }

    #[test]
    fn header_hat_vorrang() {
        let token = token_extrahieren(Some("Bearer aus-header"), Some("aus-query")).unwrap();
        assert_eq!(token, "aus-header");
    }

    #[test]
    fn anderes_schema_wird_ignoriert() {
        let fehler = token_extrahieren(Some("Basic dXNlcjpwdw=="), None).unwrap_err();
        assert_eq!(fehler, AuthError::TokenFehlt);
    }

    #[test]
    fn leerer_token_fehlt() {
        assert_eq!(
            token_extrahieren(Some("Bearer "), Some("")).unwrap_err(),
            AuthError::TokenFehlt
        );
        assert_eq!(token_extrahieren(None, None).unwrap_err(), AuthError::TokenFehlt);
    }
}
