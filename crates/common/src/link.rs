// Shadowlink - Share Link Codec
//
// Parses and generates `ss://` / `ssr://` share links. Parsing is
// tolerant: the scanner walks arbitrary text (clipboard dumps, chat
// logs), collects every candidate in order of appearance, and skips
// anything malformed instead of failing the whole scan.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE_NO_PAD};
use base64::engine::{DecodePaddingMode, Engine};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{ProxyKind, ProxyProfile};

// Links in the wild mix padded/unpadded and standard/URL-safe base64,
// so decoding accepts all four combinations. Emission is canonical
// URL-safe without padding.
const RELAXED_CONFIG: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD_RELAXED: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, RELAXED_CONFIG);
const URL_SAFE_RELAXED: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, RELAXED_CONFIG);

/// Scan `text` for share links and decode every one that is well formed.
///
/// Returns profiles in order of appearance. Malformed candidates are
/// logged at debug level and dropped; this function never fails.
pub fn parse(text: &str) -> Vec<ProxyProfile> {
    let mut profiles = Vec::new();
    let mut pos = 0;

    while pos < text.len() {
        let rest = &text[pos..];
        if rest.starts_with("ssr://") && !preceded_by_alphanumeric(text, pos) {
            let body = ssr_body(&rest[6..]);
            match parse_ssr(body) {
                Ok(profile) => profiles.push(profile),
                Err(err) => debug!(candidate = body, %err, "skipping malformed ssr link"),
            }
            pos += 6 + body.len();
        } else if rest.starts_with("ss://") && !preceded_by_alphanumeric(text, pos) {
            let body = ss_body(&rest[5..]);
            match parse_ss(body) {
                Ok(profile) => profiles.push(profile),
                Err(err) => debug!(candidate = body, %err, "skipping malformed ss link"),
            }
            pos += 5 + body.len();
        } else {
            pos += rest.chars().next().map_or(1, char::len_utf8);
        }
    }

    profiles
}

/// Generate a base-variant (`ss://`) link for `profile`.
///
/// With `exclude_password` the password segment is emitted empty, which
/// keeps the link shareable without leaking the secret. A blank remark
/// falls back to the server host.
pub fn generate_ss(profile: &ProxyProfile, exclude_password: bool) -> String {
    let password = if exclude_password {
        ""
    } else {
        profile.password.as_str()
    };
    let payload = format!(
        "{}:{}@{}:{}",
        profile.encrypt_method, password, profile.server_host, profile.server_port
    );
    let remark = effective_remark(&profile.remark, &profile.server_host);
    format!(
        "ss://{}#{}",
        URL_SAFE_NO_PAD.encode(payload),
        urlencoding::encode(remark)
    )
}

/// Generate an extended-variant (`ssr://`) link for `profile`.
///
/// The obfuscation fields default to the passthrough values (`origin`
/// protocol, `plain` obfs) when absent, matching what the scheme treats
/// as "no obfuscation".
pub fn generate_ssr(profile: &ProxyProfile) -> String {
    let protocol = non_empty(profile.protocol.as_deref()).unwrap_or("origin");
    let obfs = non_empty(profile.obfs.as_deref()).unwrap_or("plain");
    let remark = effective_remark(&profile.remark, &profile.server_host);

    let mut query = Vec::new();
    if let Some(param) = non_empty(profile.obfs_param.as_deref()) {
        query.push(format!("obfsparam={}", URL_SAFE_NO_PAD.encode(param)));
    }
    if let Some(param) = non_empty(profile.protocol_param.as_deref()) {
        query.push(format!("protoparam={}", URL_SAFE_NO_PAD.encode(param)));
    }
    query.push(format!("remarks={}", URL_SAFE_NO_PAD.encode(remark)));

    let payload = format!(
        "{}:{}:{}:{}:{}:{}/?{}",
        profile.server_host,
        profile.server_port,
        protocol,
        profile.encrypt_method,
        obfs,
        URL_SAFE_NO_PAD.encode(&profile.password),
        query.join("&")
    );
    format!("ssr://{}", URL_SAFE_NO_PAD.encode(payload))
}

/// Decode one `ss://` body: `base64(method:password@host:port)` plus an
/// optional `#`-separated, percent-encoded remark.
fn parse_ss(body: &str) -> Result<ProxyProfile> {
    let (payload, fragment) = match body.split_once('#') {
        Some((payload, fragment)) => (payload, Some(fragment)),
        None => (body, None),
    };

    let decoded = decode_base64_text(payload)?;
    let (auth, endpoint) = decoded
        .rsplit_once('@')
        .ok_or_else(|| Error::Link("ss payload is missing the '@' separator".into()))?;
    // Split the auth part on the first colon so passwords may contain
    // ':' and '@' freely.
    let (method, password) = auth
        .split_once(':')
        .ok_or_else(|| Error::Link("ss payload is missing the method separator".into()))?;
    let (host, port) = split_host_port(endpoint)?;

    let remark = match fragment {
        Some(fragment) if !fragment.is_empty() => urlencoding::decode(fragment)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| fragment.to_string()),
        _ => host.to_string(),
    };

    Ok(ProxyProfile {
        id: None,
        remark,
        server_host: host.to_string(),
        server_port: port,
        password: password.to_string(),
        encrypt_method: method.to_string(),
        protocol: None,
        protocol_param: None,
        obfs: None,
        obfs_param: None,
        kind: ProxyKind::Ss,
        timeout: 60,
        plugin: None,
    })
}

/// Decode one `ssr://` body:
/// `base64url(host:port:protocol:method:obfs:base64url(password)/?obfsparam=&protoparam=&remarks=)`
/// where every query value is base64url on its own.
fn parse_ssr(body: &str) -> Result<ProxyProfile> {
    let decoded = decode_base64_text(body)?;
    let (main, query) = match decoded.split_once("/?") {
        Some((main, query)) => (main, Some(query)),
        None => (decoded.as_str(), None),
    };

    // Split from the right so an IPv6 host keeps its colons.
    let mut fields = main.rsplitn(6, ':');
    let password_b64 = fields.next().unwrap_or_default();
    let obfs = fields
        .next()
        .ok_or_else(|| Error::Link("ssr payload is missing the obfs field".into()))?;
    let method = fields
        .next()
        .ok_or_else(|| Error::Link("ssr payload is missing the method field".into()))?;
    let protocol = fields
        .next()
        .ok_or_else(|| Error::Link("ssr payload is missing the protocol field".into()))?;
    let port = fields
        .next()
        .ok_or_else(|| Error::Link("ssr payload is missing the port field".into()))?
        .parse::<u16>()
        .map_err(|_| Error::Link("ssr payload has an invalid port".into()))?;
    let host = fields
        .next()
        .ok_or_else(|| Error::Link("ssr payload is missing the host field".into()))?;
    if host.is_empty() {
        return Err(Error::Link("ssr payload has an empty host".into()));
    }

    let password = decode_base64_text(password_b64)?;

    let mut obfs_param = None;
    let mut protocol_param = None;
    let mut remark = None;
    if let Some(query) = query {
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let Ok(value) = decode_base64_text(value) else {
                debug!(key, "skipping undecodable ssr query parameter");
                continue;
            };
            match key {
                "obfsparam" => obfs_param = non_empty_owned(value),
                "protoparam" => protocol_param = non_empty_owned(value),
                "remarks" => remark = non_empty_owned(value),
                _ => {}
            }
        }
    }

    Ok(ProxyProfile {
        id: None,
        remark: remark.unwrap_or_else(|| host.to_string()),
        server_host: host.to_string(),
        server_port: port,
        password,
        encrypt_method: method.to_string(),
        protocol: non_empty_owned(protocol.to_string()),
        protocol_param,
        obfs: non_empty_owned(obfs.to_string()),
        obfs_param,
        kind: ProxyKind::Ssr,
        timeout: 60,
        plugin: None,
    })
}

fn split_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| Error::Link("endpoint is missing a port".into()))?;
    if host.is_empty() {
        return Err(Error::Link("endpoint has an empty host".into()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::Link(format!("invalid port in endpoint {endpoint:?}")))?;
    Ok((host, port))
}

fn decode_base64_text(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let bytes = STANDARD_RELAXED
        .decode(trimmed)
        .or_else(|_| URL_SAFE_RELAXED.decode(trimmed))
        .map_err(|err| Error::Link(format!("invalid base64 payload: {err}")))?;
    String::from_utf8(bytes).map_err(|_| Error::Link("payload is not valid UTF-8".into()))
}

fn effective_remark<'a>(remark: &'a str, host: &'a str) -> &'a str {
    if remark.is_empty() {
        host
    } else {
        remark
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

fn non_empty_owned(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// The base64 run of an `ssr://` body (no fragment follows).
fn ssr_body(rest: &str) -> &str {
    let end = rest
        .find(|c: char| !is_base64_char(c))
        .unwrap_or(rest.len());
    &rest[..end]
}

/// The base64 run of an `ss://` body plus an optional `#` fragment,
/// which extends to the next whitespace.
fn ss_body(rest: &str) -> &str {
    let payload_end = rest
        .find(|c: char| !is_base64_char(c))
        .unwrap_or(rest.len());
    if rest[payload_end..].starts_with('#') {
        let fragment_end = rest[payload_end + 1..]
            .find(char::is_whitespace)
            .map(|i| payload_end + 1 + i)
            .unwrap_or(rest.len());
        &rest[..fragment_end]
    } else {
        &rest[..payload_end]
    }
}

fn is_base64_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_')
}

// Avoids treating the tail of e.g. `wss://` as a share link.
fn preceded_by_alphanumeric(text: &str, pos: usize) -> bool {
    pos > 0 && text.as_bytes()[pos - 1].is_ascii_alphanumeric()
}
