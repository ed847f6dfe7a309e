//! Response constructors.
//!
//! hyper writes the status line, `Content-Length`, and `Connection`
//! headers; these helpers only pick the status, content type, and body.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// A fully buffered response.
pub type HttpResponse = Response<Full<Bytes>>;

fn with_status(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> HttpResponse {
    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

/// `200 OK` carrying `body`.
pub fn ok(content_type: &'static str, body: impl Into<Bytes>) -> HttpResponse {
    with_status(StatusCode::OK, content_type, body.into())
}

/// `400 Bad Request` with a plain-text `message`.
pub fn bad_request(message: &str) -> HttpResponse {
    with_status(
        StatusCode::BAD_REQUEST,
        "text/plain",
        Bytes::copy_from_slice(message.as_bytes()),
    )
}
