//! `data:` URL decoding.
//!
//! Format: `data:[<mediatype>][;base64],<data>`. The payload is percent-decoded
//! first and then, for `;base64`, base64-decoded.

use base64::Engine;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use url::Url;

use crate::{NetError, Response};

const DEFAULT_MEDIA_TYPE: &str = "text/plain;charset=US-ASCII";

/// Decode a `data:` URL into a 200 response.
pub fn decode(url: &Url) -> Result<Response, NetError> {
    if url.scheme() != "data" {
        return Err(NetError::InvalidDataUrl(format!("not a data URL: {url}")));
    }

    let mut stripped = url.clone();
    stripped.set_fragment(None);
    let rest = &stripped.as_str()["data:".len()..];

    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| NetError::InvalidDataUrl("missing `,`".to_string()))?;

    let (media_type, is_base64) = match meta.rsplit_once(';') {
        Some((mt, enc)) if enc.trim().eq_ignore_ascii_case("base64") => (mt, true),
        _ => (meta, false),
    };
    let media_type = match media_type.trim() {
        "" => DEFAULT_MEDIA_TYPE.to_string(),
        mt if mt.starts_with(';') => format!("text/plain{mt}"),
        mt => mt.to_string(),
    };

    let raw = urlencoding::decode_binary(payload.as_bytes());
    let body = if is_base64 {
        let compact: Vec<u8> = raw.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact)
            .map_err(|e| NetError::InvalidDataUrl(e.to_string()))?
    } else {
        raw.into_owned()
    };

    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&media_type)
        .map_err(|e| NetError::InvalidDataUrl(e.to_string()))?;
    headers.insert(header::CONTENT_TYPE, content_type);

    Ok(Response::new(url.clone(), StatusCode::OK, headers, Bytes::from(body)))
}
