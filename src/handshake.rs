//! Stateless classification/extraction of the first application message on
//! an accepted socket. Registry-dependent decisions (name clash, auth,
//! nearest-mount lookup) are left to the reactor; this module only ever
//! inspects the bytes it is given.

use crate::codec::{base64_decode, parse_position_header};
use crate::error::CasterError;

/// A publisher (`POST`) registration request, fully parsed.
#[derive(Debug, Clone)]
pub struct PublisherRequest {
    pub name: String,
    pub username: String,
    pub password: String,
    pub position: Option<(f64, f64)>,
    /// The verbatim `STR;...` advertisement line, `\r\n`-terminated. Empty
    /// if the publisher sent no `Ntrip-STR` header.
    pub advertisement: String,
    /// Bytes read past the terminating `\r\n\r\n` in the same initial read;
    /// already-arrived payload that must be treated as stream data.
    pub trailing: Vec<u8>,
}

/// A subscriber (`GET`) request, fully parsed.
#[derive(Debug, Clone)]
pub struct SubscriberRequest {
    pub name: String,
    /// `None` only when no `Authorization` header was present at all.
    pub auth: Option<(String, String)>,
    pub position: Option<(f64, f64)>,
    /// `true` for `HTTP/1.0` (legacy `ICY 200 OK` response mode).
    pub legacy: bool,
}

/// The outcome of classifying the first message on a socket.
#[derive(Debug, Clone)]
pub enum ParsedRequest {
    Publisher(PublisherRequest),
    Subscriber(SubscriberRequest),
    /// `GET / HTTP/1.x` — always answered with the source table.
    SourceTable,
}

fn split_header_and_trailing(buf: &[u8]) -> (String, Vec<u8>) {
    const BOUNDARY: &[u8] = b"\r\n\r\n";
    match buf.windows(BOUNDARY.len()).position(|w| w == BOUNDARY) {
        Some(idx) => {
            let header = String::from_utf8_lossy(&buf[..idx]).into_owned();
            let trailing = buf[idx + BOUNDARY.len()..].to_vec();
            (header, trailing)
        },
        None => (String::from_utf8_lossy(buf).into_owned(), Vec::new()),
    }
}

struct RequestLine {
    method: String,
    path: String,
    version: String,
}

fn parse_request_line(line: &str) -> Result<RequestLine, CasterError> {
    let mut parts = line.trim_end_matches('\r').split_whitespace();
    let method = parts.next().ok_or_else(|| CasterError::Parse("empty request line".to_string()))?;
    let path = parts.next().ok_or_else(|| CasterError::Parse("missing request path".to_string()))?;
    let version = parts
        .next()
        .ok_or_else(|| CasterError::Parse("missing request version".to_string()))?;

    if method != "GET" && method != "POST" {
        return Err(CasterError::Parse(format!("unsupported method: {method}")));
    }
    if !path.starts_with('/') {
        return Err(CasterError::Parse("path must start with '/'".to_string()));
    }
    let version = version.trim_start_matches("HTTP/");
    if version != "1.0" && version != "1.1" {
        return Err(CasterError::Parse(format!("unsupported version: {version}")));
    }

    Ok(RequestLine {
        method: method.to_string(),
        path: path.to_string(),
        version: version.to_string(),
    })
}

fn find_header<'a>(lines: &[&'a str], prefix: &str) -> Option<&'a str> {
    lines
        .iter()
        .find(|line| line.trim_start().starts_with(prefix))
        .map(|line| line.trim_start()[prefix.len()..].trim_end_matches('\r').trim())
}

fn parse_basic_auth(lines: &[&str]) -> Result<Option<(String, String)>, CasterError> {
    let Some(b64) = find_header(lines, "Authorization: Basic ") else {
        return Ok(None);
    };
    let decoded = base64_decode(b64)?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| CasterError::Parse("authorization: not utf-8".to_string()))?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or_else(|| CasterError::Parse("authorization: missing ':'".to_string()))?;
    if user.is_empty() || pass.is_empty() {
        return Err(CasterError::Auth);
    }
    Ok(Some((user.to_string(), pass.to_string())))
}

fn parse_optional_position(lines: &[&str]) -> Option<(f64, f64)> {
    find_header(lines, "Position: ").and_then(|v| parse_position_header(v).ok())
}

fn parse_ntrip_str(lines: &[&str], name: &str) -> Result<(String, Option<(f64, f64)>), CasterError> {
    let Some(value) = find_header(lines, "Ntrip-STR: ") else {
        return Ok((String::new(), None));
    };

    let sections: Vec<&str> = value.split(';').collect();
    if sections.len() > 4 && (sections[1] != name || sections[2] != name) {
        return Err(CasterError::Parse(
            "Ntrip-STR mount fields do not match request path".to_string(),
        ));
    }

    let position = if sections.len() > 9 && sections[9].contains(',') {
        parse_position_header(sections[9]).ok()
    } else {
        None
    };

    Ok((format!("{value}\r\n"), position))
}

fn extract_name(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

/// Classify and extract an accepted socket's first application message.
pub fn parse_request(buf: &[u8]) -> Result<ParsedRequest, CasterError> {
    let (header, trailing) = split_header_and_trailing(buf);
    let mut lines: Vec<&str> = header.split("\r\n").collect();
    if lines.is_empty() {
        return Err(CasterError::Parse("empty request".to_string()));
    }
    let request_line = parse_request_line(lines.remove(0))?;
    let name = extract_name(&request_line.path);

    match request_line.method.as_str() {
        "POST" => {
            if request_line.version != "1.1" {
                return Err(CasterError::Parse(
                    "publisher registration requires HTTP/1.1".to_string(),
                ));
            }
            if name.is_empty() {
                return Err(CasterError::Parse("empty mount point name".to_string()));
            }

            let (username, password) = parse_basic_auth(&lines)?
                .ok_or_else(|| CasterError::Parse("missing Authorization header".to_string()))?;
            let mut position = parse_optional_position(&lines);
            let (advertisement, str_position) = parse_ntrip_str(&lines, &name)?;
            if position.is_none() {
                position = str_position;
            }

            Ok(ParsedRequest::Publisher(PublisherRequest {
                name,
                username,
                password,
                position,
                advertisement,
                trailing,
            }))
        },
        "GET" => {
            if name.is_empty() {
                return Ok(ParsedRequest::SourceTable);
            }

            let legacy = request_line.version == "1.0";
            let auth = parse_basic_auth(&lines)?;
            let position = parse_optional_position(&lines);

            Ok(ParsedRequest::Subscriber(SubscriberRequest {
                name,
                auth,
                position,
                legacy,
            }))
        },
        _ => unreachable!("parse_request_line rejects all but GET/POST"),
    }
}
