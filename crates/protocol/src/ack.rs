//! Ack-Nutzdaten fuer Request/Response-Events
//!
//! Erfolg: `{success: true, ...felder}`
//! Fehler: `{success: false, error, code, ...details}`

use serde_json::{json, Map, Value};

use crate::error::ErrorCode;

/// Erfolgs-Ack mit zusaetzlichen Feldern
///
/// `felder` sollte ein JSON-Objekt sein; andere Werte landen unter `data`.
pub fn erfolg(felder: Value) -> Value {
    let mut objekt = Map::new();
    objekt.insert("success".into(), Value::Bool(true));
    match felder {
        Value::Object(map) => objekt.extend(map),
        Value::Null => {}
        anderes => {
            objekt.insert("data".into(), anderes);
        }
    }
    Value::Object(objekt)
}

/// Fehler-Ack
pub fn fehler(code: ErrorCode, nachricht: &str) -> Value {
    json!({
        "success": false,
        "error": nachricht,
        "code": code,
    })
}

/// Fehler-Ack mit Zusatzfeldern (z.B. `status`, `allowedActions`)
pub fn fehler_mit(code: ErrorCode, nachricht: &str, details: Value) -> Value {
    let mut basis = fehler(code, nachricht);
    if let (Value::Object(ziel), Value::Object(extra)) = (&mut basis, details) {
        ziel.extend(extra);
    }
    basis
}
