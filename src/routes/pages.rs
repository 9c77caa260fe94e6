use std::collections::HashMap;

use askama::Template;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

use crate::error::ErrorPage;

#[derive(Template)]
#[template(path = "callback_success.html")]
struct SuccessPage;

fn render(template: &impl Template) -> Response {
    match template.render() {
        Ok(body) => Html(body).into_response(),
        Err(e) => {
            tracing::error!("failed to process template: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /callback_success: landing page after a completed flow
pub async fn callback_success() -> Response {
    render(&SuccessPage)
}

/// GET /callback_error: landing page for failed flows
pub async fn callback_error(Query(query): Query<HashMap<String, String>>) -> Response {
    let title = query.get("error").map(String::as_str).unwrap_or("Error");
    let message = query
        .get("error_description")
        .map(String::as_str)
        .unwrap_or_default();
    render(&ErrorPage { title, message })
}

/// GET /health, GET /ready
pub async fn ok() -> StatusCode {
    StatusCode::OK
}
