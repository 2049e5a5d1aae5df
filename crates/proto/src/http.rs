//! Raw HTTP/1.1 helpers for segmented tunnel streams.
//!
//! A tunnel peer may ship a literal HTTP/1.1 request in base64 chunks over
//! `data` frames; the node reassembles and answers with a literal HTTP/1.1
//! response the same way. Only the minimal subset is handled: request line,
//! `Content-Length`, and a byte body. Header lookup is case-insensitive
//! (HTTP headers are case-insensitive even though some peers emit
//! `Content-Length:` exactly).

/// A fully received raw request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

/// Attempts to parse a complete request out of the accumulator.
///
/// Returns `None` until the header terminator and the full declared body
/// have arrived. A missing or unparsable `Content-Length` is treated as
/// zero.
pub fn try_parse_request(buf: &[u8]) -> Option<RawRequest> {
    let header_end = find_subslice(buf, b"\r\n\r\n")?;
    let header = std::str::from_utf8(&buf[..header_end]).ok()?;

    let request_line = header.lines().next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    if method.is_empty() || path.is_empty() {
        return None;
    }

    let content_length = parse_content_length(header).unwrap_or(0);

    let body_start = header_end + 4;
    let available = buf.len().saturating_sub(body_start);
    if content_length > available {
        return None;
    }

    Some(RawRequest {
        method,
        path,
        body: buf[body_start..body_start + content_length].to_vec(),
    })
}

/// The `Content-Length` a partial request declares, once its header block
/// has fully arrived. `None` while the terminator is still missing;
/// `Some(0)` when the header carries no length.
pub fn declared_content_length(buf: &[u8]) -> Option<usize> {
    let header_end = find_subslice(buf, b"\r\n\r\n")?;
    let header = std::str::from_utf8(&buf[..header_end]).ok()?;
    Some(parse_content_length(header).unwrap_or(0))
}

fn parse_content_length(header: &str) -> Option<usize> {
    header.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })
}

/// Builds a literal HTTP/1.1 response carrying a JSON body.
pub fn build_raw_response(status: u16, json_body: &str) -> String {
    let mut raw = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    raw.push_str("Content-Type: application/json\r\n");
    raw.push_str(&format!("Content-Length: {}\r\n", json_body.len()));
    raw.push_str("Connection: close\r\n");
    raw.push_str("\r\n");
    raw.push_str(json_body);
    raw
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Error",
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
