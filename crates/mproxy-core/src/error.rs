//! Maps executor failures onto client-visible HTTP responses.

use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, HeaderValue, Response, StatusCode};
use serde_json::json;

use mproxy_provider_core::ExecutorError;
use mproxy_translator::Format;

pub fn error_response(err: &ExecutorError, dialect: Format) -> Response<Body> {
    match err {
        // 4xx bodies from upstream pass through verbatim, status included.
        ExecutorError::UpstreamClientError {
            status,
            headers,
            body,
        } => {
            let mut response = Response::new(Body::from(body.clone()));
            *response.status_mut() =
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            for (name, value) in headers {
                if name.eq_ignore_ascii_case("content-type") || name.eq_ignore_ascii_case("retry-after") {
                    if let (Ok(name), Ok(value)) = (
                        axum::http::HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(value),
                    ) {
                        response.headers_mut().insert(name, value);
                    }
                }
            }
            response
        }
        _ => {
            let status = status_for(err);
            json_error(status, &err.to_string(), dialect)
        }
    }
}

fn status_for(err: &ExecutorError) -> StatusCode {
    match err {
        ExecutorError::NoEligibleAuth { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ExecutorError::UpstreamTransient(_) | ExecutorError::SubprocessUnavailable(_) => {
            StatusCode::BAD_GATEWAY
        }
        ExecutorError::UpstreamAuthExpired(_) => StatusCode::UNAUTHORIZED,
        ExecutorError::Translation(_) => StatusCode::BAD_REQUEST,
        ExecutorError::StreamAborted(_) => StatusCode::BAD_GATEWAY,
        ExecutorError::MissingAuthAttribute(_)
        | ExecutorError::InvalidConfig(_)
        | ExecutorError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ExecutorError::UpstreamClientError { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
    }
}

pub fn json_error(status: StatusCode, message: &str, dialect: Format) -> Response<Body> {
    let body = match dialect {
        Format::Claude => json!({
            "type": "error",
            "error": {"type": error_type(status), "message": message},
        }),
        _ => json!({
            "error": {"message": message, "type": error_type(status)},
        }),
    };
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_type(status: StatusCode) -> &'static str {
    match status {
        StatusCode::UNAUTHORIZED => "authentication_error",
        StatusCode::NOT_FOUND => "not_found_error",
        StatusCode::BAD_REQUEST => "invalid_request_error",
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => "overloaded_error",
        _ => "api_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn taxonomy_maps_to_statuses() {
        let no_auth = ExecutorError::NoEligibleAuth {
            provider: "codex".to_string(),
        };
        assert_eq!(status_for(&no_auth), StatusCode::SERVICE_UNAVAILABLE);

        let translation = ExecutorError::Translation(
            mproxy_translator::TranslateError::InvalidPayload("bad".to_string()),
        );
        assert_eq!(status_for(&translation), StatusCode::BAD_REQUEST);

        assert_eq!(
            status_for(&ExecutorError::UpstreamTransient("reset".to_string())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn client_errors_pass_status_through() {
        let err = ExecutorError::UpstreamClientError {
            status: 429,
            headers: vec![("Retry-After".to_string(), "30".to_string())],
            body: Bytes::from_static(b"{\"slow\":true}"),
        };
        let response = error_response(&err, Format::OpenAI);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("retry-after").and_then(|v| v.to_str().ok()),
            Some("30")
        );
    }
}
