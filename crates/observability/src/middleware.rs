//! Request-Timing Middleware fuer Axum
//!
//! Misst die Antwortzeit jeder HTTP-Anfrage, protokolliert sie als
//! strukturiertes Log-Event und traegt sie in die Prometheus-Metriken ein.

use axum::{
    body::Body,
    extract::State,
    http::{Request, Response},
    middleware::Next,
};
use std::time::Instant;

use crate::metrics::VitalinkMetriken;

/// Erstellt den Tower-Layer fuer Request-Tracing
pub fn request_timing_layer() -> tower_http::trace::TraceLayer<
    tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>,
> {
    tower_http::trace::TraceLayer::new_for_http()
}

/// Axum-Middleware-Funktion: misst Antwortzeit, loggt und zaehlt.
///
/// Verwendung:
/// ```ignore
/// Router::new()
///     .route("/", get(handler))
///     .layer(axum::middleware::from_fn_with_state(metriken, timing_middleware))
/// ```
pub async fn timing_middleware(
    State(metriken): State<VitalinkMetriken>,
    req: Request<Body>,
    next: Next,
) -> Response<Body> {
    let methode = req.method().to_string();
    let pfad = pfad_label(req.uri().path());
    let start = Instant::now();

    let response = next.run(req).await;

    let dauer = start.elapsed();
    let status = response.status().as_u16();

    metriken
        .http_requests_total
        .with_label_values(&[&methode, &pfad, &status.to_string()])
        .inc();
    metriken
        .http_request_duration_seconds
        .with_label_values(&[&methode, &pfad])
        .observe(dauer.as_secs_f64());

    tracing::info!(
        method = %methode,
        path = %pfad,
        status = status,
        duration_ms = dauer.as_millis(),
        "HTTP-Anfrage abgeschlossen"
    );

    response
}

/// Ersetzt IDs in Admin-Pfaden, damit die Label-Kardinalitaet begrenzt bleibt
fn pfad_label(pfad: &str) -> String {
    let teile: Vec<&str> = pfad.split('/').collect();
    match teile.as_slice() {
        ["", "admin", "benutzer", _, rest @ ..] => {
            let mut label = String::from("/admin/benutzer/:id");
            for teil in rest {
                label.push('/');
                label.push_str(teil);
            }
            label
        }
        _ => pfad.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use tower::ServiceExt;

    #[test]
    fn pfad_label_ersetzt_benutzer_id() {
        assert_eq!(
            pfad_label("/admin/benutzer/u-123/trennen"),
            "/admin/benutzer/:id/trennen"
        );
        assert_eq!(pfad_label("/health"), "/health");
        assert_eq!(pfad_label("/admin/verbindungen"), "/admin/verbindungen");
    }

    #[tokio::test]
    async fn middleware_zaehlt_anfragen() {
        let metriken = VitalinkMetriken::neu().unwrap();
        let app = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(axum::middleware::from_fn_with_state(
                metriken.clone(),
                timing_middleware,
            ));

        let antwort = app
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(antwort.status(), StatusCode::OK);
        assert_eq!(
            metriken
                .http_requests_total
                .with_label_values(&["GET", "/ping", "200"])
                .get(),
            1
        );
    }
}
