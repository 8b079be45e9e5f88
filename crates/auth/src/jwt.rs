//! JWT-Pruefung (HS256)
//!
//! Claims: `{userId, role, email?, exp, iat?}`. Ablauf wird ohne Toleranz
//! geprueft, der Algorithmus ist fest auf HS256 gesetzt.

use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use vitalink_core::{Rolle, UserId};

use crate::error::{AuthError, AuthResult};

/// Claims im Token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub user_id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
}

/// Identitaet, die an eine Verbindung gehaengt wird
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identitaet {
    pub user_id: UserId,
    pub rolle: Rolle,
    pub email: Option<String>,
}

/// Prueft Tokens gegen das gemeinsame Secret
#[derive(Clone)]
pub struct JwtPruefer {
    schluessel: DecodingKey,
    validierung: Validation,
}

impl JwtPruefer {
    /// Erstellt einen Pruefer fuer das gegebene HS256-Secret
    pub fn neu(secret: &str) -> Self {
        let mut validierung = Validation::new(Algorithm::HS256);
        validierung.leeway = 0;
        validierung.set_required_spec_claims(&["exp"]);
        Self {
            schluessel: DecodingKey::from_secret(secret.as_bytes()),
            validierung,
        }
    }

    /// Prueft Signatur und Ablauf und liefert die Identitaet
    pub fn pruefen(&self, token: &str) -> AuthResult<Identitaet> {
        let daten = decode::<TokenClaims>(token, &self.schluessel, &self.validierung).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenAbgelaufen,
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_)
                | ErrorKind::MissingRequiredClaim(_) => AuthError::TokenUngueltig(e.to_string()),
                _ => AuthError::VerifizierungFehlgeschlagen(e.to_string()),
            },
        )?;

        let claims = daten.claims;
        if claims.user_id.trim().is_empty() {
            return Err(AuthError::TokenUngueltig("userId ist leer".into()));
        }

        tracing::trace!(user_id = %claims.user_id, role = %claims.role, "Token gueltig");

        Ok(Identitaet {
            user_id: UserId::neu(claims.user_id),
            rolle: Rolle::neu(claims.role),
            email: claims.email,
        })
    }
}

impl std::fmt::Debug for JwtPruefer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtPruefer").finish_non_exhaustive()
    }
}
