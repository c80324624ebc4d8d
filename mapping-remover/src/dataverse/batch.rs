// OData $batch (multipart/mixed) encoding for ExecuteMultiple.
//
// Only GET parts are needed: every batched request is a metadata read.

use crate::error::{ServiceError, ServiceResult};
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPart {
    pub status: u16,
    pub body: String,
}

impl BatchPart {
    /// Placeholder status for a part that carried no HTTP status line.
    pub const MALFORMED: u16 = 0;

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Build a batch body of GET requests. `urls` must be absolute.
pub fn encode_get_batch(boundary: &str, urls: &[String]) -> String {
    let mut body = String::new();
    for url in urls {
        body.push_str(&format!("--{}\r\n", boundary));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str("Content-Transfer-Encoding: binary\r\n\r\n");
        body.push_str(&format!("GET {} HTTP/1.1\r\n", url));
        body.push_str("Accept: application/json\r\n\r\n");
    }
    body.push_str(&format!("--{}--\r\n", boundary));
    body
}

/// Pull `boundary=...` out of a multipart Content-Type header.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let re = Regex::new(r#"(?i)boundary="?([^";]+)"?"#).ok()?;
    re.captures(content_type)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Split a batch response into its HTTP parts, in request order. A part without a status
/// line is kept as a `MALFORMED` failure so later parts stay aligned with their requests.
pub fn decode_batch_response(boundary: &str, body: &str) -> ServiceResult<Vec<BatchPart>> {
    let status_re = Regex::new(r"(?m)^HTTP/\d\.\d\s+(\d{3})")
        .map_err(|e| ServiceError::remote(format!("Internal error: status regex: {}", e)))?;

    let delimiter = format!("--{}", boundary);
    let mut parts = Vec::new();

    // The first segment is the preamble before the first delimiter.
    for raw in body.split(delimiter.as_str()).skip(1) {
        let chunk = raw.trim_start_matches(['\r', '\n']);
        if chunk.trim().is_empty() || chunk.starts_with("--") {
            continue;
        }

        let Some(status_match) = status_re.captures(chunk) else {
            parts.push(BatchPart {
                status: BatchPart::MALFORMED,
                body: String::new(),
            });
            continue;
        };
        let status: u16 = status_match[1]
            .parse()
            .map_err(|_| ServiceError::remote("Malformed status line in batch response"))?;

        // Body follows the blank line that ends the inner HTTP headers.
        let after_status = &chunk[status_match.get(0).map(|m| m.end()).unwrap_or(0)..];
        let body = match find_header_end(after_status) {
            Some(idx) => after_status[idx..].trim().to_string(),
            None => String::new(),
        };
        parts.push(BatchPart { status, body });
    }

    Ok(parts)
}

fn find_header_end(s: &str) -> Option<usize> {
    if let Some(i) = s.find("\r\n\r\n") {
        return Some(i + 4);
    }
    s.find("\n\n").map(|i| i + 2)
}

/// Extract `error.message` / `error.code` from an OData error payload.
pub fn odata_error(body: &str) -> (Option<String>, Option<String>) {
    #[derive(serde::Deserialize)]
    struct Envelope {
        error: Option<ErrorBody>,
    }
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        code: Option<String>,
        message: Option<String>,
    }

    match serde_json::from_str::<Envelope>(body) {
        Ok(Envelope {
            error: Some(ErrorBody { code, message }),
        }) => (code.filter(|c| !c.is_empty()), message),
        _ => (None, None),
    }
}
