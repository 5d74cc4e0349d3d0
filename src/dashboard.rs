//! Read-only operations panel: queue counters, the latest artifacts, and
//! the operator's error-replay endpoint.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::queue::QueueId;
use crate::store::{ArtifactFilter, ArtifactSummary, QueueCounters, Store};

const RECENT_LIMIT: i64 = 10;
const DEFAULT_RETRY_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<dyn Store>,
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/", get(index))
        .route("/retry-errors", post(retry_errors))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
pub struct IndexParams {
    pub epoch: Option<String>,
    pub subject: Option<String>,
}

async fn index(State(state): State<DashboardState>, Query(params): Query<IndexParams>) -> Response {
    let counters = match state.store.counters(QueueId::Primary).await {
        Ok(counters) => counters,
        Err(err) => {
            tracing::warn!(error = %err, "store not ready; serving refresh page");
            return (StatusCode::SERVICE_UNAVAILABLE, Html(render_unready())).into_response();
        }
    };

    let filter = ArtifactFilter {
        epoca: params.epoch.clone().filter(|s| !s.trim().is_empty()),
        materia: params.subject.clone().filter(|s| !s.trim().is_empty()),
    };
    let recent = match state.store.find_recent(&filter, RECENT_LIMIT).await {
        Ok(rows) => rows,
        Err(err) => {
            tracing::warn!(error = %err, "artifact query failed; serving refresh page");
            return (StatusCode::SERVICE_UNAVAILABLE, Html(render_unready())).into_response();
        }
    };

    Html(render_index(&counters, &recent, &params)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct RetryParams {
    pub limit: Option<u32>,
}

async fn retry_errors(
    State(state): State<DashboardState>,
    Query(params): Query<RetryParams>,
) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_RETRY_LIMIT);
    match state.store.retry_errors(QueueId::Primary, limit).await {
        Ok(moved) => {
            tracing::info!(moved, "error entries returned to pending");
            Json(serde_json::json!({ "retried": moved })).into_response()
        }
        Err(err) => {
            tracing::warn!(error = %err, "retry-errors failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "store unavailable" })),
            )
                .into_response()
        }
    }
}

/// Served while the store is unreachable; the meta tag keeps the browser
/// polling until it comes up.
pub fn render_unready() -> String {
    "<!doctype html><html><head><meta charset=\"utf-8\">\
     <meta http-equiv=\"refresh\" content=\"5\">\
     <title>Tepantlatia</title></head>\
     <body><p>store not ready; retrying…</p></body></html>"
        .to_string()
}

pub fn render_index(
    counters: &QueueCounters,
    recent: &[ArtifactSummary],
    params: &IndexParams,
) -> String {
    let mut page = String::with_capacity(4096);
    page.push_str(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>Tepantlatia</title></head><body>",
    );
    page.push_str("<h1>Tepantlatia ingestion</h1>");

    page.push_str("<h2>Primary queue</h2><table border=\"1\"><tr>");
    for header in ["total", "pending", "processing", "completed", "error", "deferred", "unavailable"]
    {
        page.push_str(&format!("<th>{header}</th>"));
    }
    page.push_str("</tr><tr>");
    for value in [
        counters.total,
        counters.pending,
        counters.processing,
        counters.completed,
        counters.error,
        counters.deferred,
        counters.unavailable,
    ] {
        page.push_str(&format!("<td>{value}</td>"));
    }
    page.push_str("</tr></table>");

    page.push_str("<h2>Latest theses</h2>");
    page.push_str("<form method=\"get\" action=\"/\">");
    page.push_str(&format!(
        "<label>Época <input name=\"epoch\" value=\"{}\"></label> ",
        escape_html(params.epoch.as_deref().unwrap_or_default())
    ));
    page.push_str(&format!(
        "<label>Materia <input name=\"subject\" value=\"{}\"></label> ",
        escape_html(params.subject.as_deref().unwrap_or_default())
    ));
    page.push_str("<button type=\"submit\">Filtrar</button></form>");

    page.push_str(
        "<table border=\"1\"><tr><th>registro</th><th>rubro</th><th>época</th>\
         <th>materias</th><th>vector</th><th>actualizado</th></tr>",
    );
    for row in recent {
        let updated = row
            .updated_at
            .map(|t| t.try_to_rfc3339_string().unwrap_or_default())
            .unwrap_or_default();
        page.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape_html(&row.key),
            escape_html(row.rubro.as_deref().unwrap_or_default()),
            escape_html(row.epoca.as_deref().unwrap_or_default()),
            escape_html(row.materias.as_deref().unwrap_or_default()),
            if row.vectorized { "sí" } else { "no" },
            escape_html(&updated),
        ));
    }
    page.push_str("</table></body></html>");
    page
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_page_lists_counters_and_rows() {
        let counters = QueueCounters {
            total: 12,
            pending: 3,
            processing: 1,
            completed: 6,
            error: 1,
            deferred: 1,
            unavailable: 0,
        };
        let recent = vec![ArtifactSummary {
            key: "292564".into(),
            rubro: Some("AMPARO <directo>".into()),
            epoca: Some("11a".into()),
            materias: Some("Penal".into()),
            vectorized: true,
            updated_at: None,
        }];
        let page = render_index(&counters, &recent, &IndexParams::default());
        assert!(page.contains("<td>12</td>"));
        assert!(page.contains("292564"));
        assert!(page.contains("AMPARO &lt;directo&gt;"), "row fields are escaped");
        assert!(page.contains("<td>sí</td>"));
    }

    #[test]
    fn filter_values_round_trip_escaped() {
        let params = IndexParams {
            epoch: Some("11a".into()),
            subject: Some("\"Penal\"".into()),
        };
        let page = render_index(&QueueCounters::default(), &[], &params);
        assert!(page.contains("value=\"11a\""));
        assert!(page.contains("&quot;Penal&quot;"));
    }

    #[test]
    fn unready_page_refreshes() {
        assert!(render_unready().contains("http-equiv=\"refresh\""));
    }
}
