use std::collections::HashMap;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::AppResult;

/// Upper bound for the request head and, separately, the body.
const MAX_REQUEST_BYTES: usize = 1024 * 1024;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

pub(super) const JSON_CONTENT_TYPE: &str = "application/json";
pub(super) const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug)]
pub(super) struct HttpRequest {
    pub(super) method: String,
    /// Path without the query string.
    pub(super) path: String,
    /// Lower-cased names.
    pub(super) headers: HashMap<String, String>,
    pub(super) body: Vec<u8>,
}

/// Request-level failure answered with `status` and a JSON error body.
#[derive(Debug)]
pub(super) struct ControlError {
    pub(super) status: u16,
    pub(super) message: String,
}

impl ControlError {
    pub(super) fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }
}

/// Reads one request; the connection carries nothing after it.
pub(super) async fn read_http_request(socket: &mut TcpStream) -> Result<HttpRequest, ControlError> {
    let mut buffer = Vec::with_capacity(1024);
    let head_len = loop {
        if let Some(end) = head_end(&buffer) {
            break end;
        }
        if buffer.len() >= MAX_REQUEST_BYTES {
            return Err(ControlError::new(413, "Request head is too large"));
        }
        let read = socket
            .read_buf(&mut buffer)
            .await
            .map_err(|err| ControlError::bad_request(format!("Read failed: {}", err)))?;
        if read == 0 {
            return Err(ControlError::bad_request("Connection closed mid-request"));
        }
    };

    let mut request = parse_head(buffer.get(..head_len).unwrap_or_default())?;
    let content_length = match request.headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_not_a_number| ControlError::bad_request("Content-Length is not a number"))?,
        None => 0,
    };
    if content_length > MAX_REQUEST_BYTES {
        return Err(ControlError::new(413, "Request body is too large"));
    }

    let body_start = head_len
        .saturating_add(HEAD_TERMINATOR.len())
        .min(buffer.len());
    let mut body = buffer.split_off(body_start);
    let missing = content_length.saturating_sub(body.len());
    if missing > 0 {
        let mut rest = vec![0u8; missing];
        socket
            .read_exact(&mut rest)
            .await
            .map_err(|_eof| ControlError::bad_request("Body is shorter than Content-Length"))?;
        body.extend_from_slice(&rest);
    }
    body.truncate(content_length);
    request.body = body;
    Ok(request)
}

fn head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

/// Parses the request line and headers; the body is left empty.
pub(super) fn parse_head(head: &[u8]) -> Result<HttpRequest, ControlError> {
    let text = std::str::from_utf8(head)
        .map_err(|_not_utf8| ControlError::bad_request("Request head is not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let (Some(method), Some(target)) = (request_line.next(), request_line.next()) else {
        return Err(ControlError::bad_request("Malformed request line"));
    };
    let path = target.split_once('?').map_or(target, |(path, _query)| path);

    let mut headers = HashMap::new();
    for line in lines.filter(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ControlError::bad_request(format!("Malformed header '{}'", line)))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path: path.to_owned(),
        headers,
        body: Vec::new(),
    })
}

const fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub(super) fn error_body(message: &str) -> Vec<u8> {
    #[derive(Serialize)]
    struct ErrorBody<'msg> {
        error: &'msg str,
    }
    serde_json::to_vec(&ErrorBody { error: message })
        .unwrap_or_else(|_unencodable| b"{\"error\":\"unencodable error\"}".to_vec())
}

/// Writes a complete response and closes the write half.
///
/// # Errors
///
/// Returns an error when the peer went away.
pub(super) async fn write_response(
    socket: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> AppResult<()> {
    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason_phrase(status),
        content_type,
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    socket.write_all(&response).await?;
    socket.shutdown().await?;
    Ok(())
}
