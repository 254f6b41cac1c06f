//! Textual proxy formats accepted by single and batch imports.
//!
//! Supported shapes:
//! - `scheme://[user:pass@]host:port` with scheme `http`, `https` or `socks5`
//! - `user:pass@host:port`
//! - `host:port:user:pass`
//! - `host:port`
//!
//! Everything without an explicit scheme is treated as `http`.

use thiserror::Error;
use url::Url;

use crate::model::ProxyScheme;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedProxy {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyParseError {
    #[error("empty proxy line")]
    Empty,
    #[error("unsupported proxy scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("invalid port `{0}`")]
    InvalidPort(String),
    #[error("missing host")]
    MissingHost,
    #[error("username and password must be given together")]
    IncompleteCredentials,
    #[error("unrecognised proxy format")]
    Format,
}

/// One rejected line of a batch import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLineError {
    /// 1-based position among the split entries.
    pub line: usize,
    pub input: String,
    pub error: ProxyParseError,
}

pub fn parse_proxy_line(line: &str) -> Result<ParsedProxy, ProxyParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProxyParseError::Empty);
    }

    if line.contains("://") {
        return parse_url_form(line);
    }

    if let Some((auth, server)) = line.rsplit_once('@') {
        let (username, password) = auth.split_once(':').ok_or(ProxyParseError::Format)?;
        let (host, port) = split_host_port(server)?;
        return build(ProxyScheme::Http, host, port, Some(username), Some(password));
    }

    let parts: Vec<&str> = line.split(':').collect();
    match parts.as_slice() {
        [host, port] => build(ProxyScheme::Http, host, parse_port(port)?, None, None),
        [host, port, username, password] => build(
            ProxyScheme::Http,
            host,
            parse_port(port)?,
            Some(username),
            Some(password),
        ),
        _ => Err(ProxyParseError::Format),
    }
}

/// Splits a batch on `;` when present, otherwise on newlines; blank entries
/// and `#` comments are skipped.
pub fn parse_proxy_batch(text: &str) -> (Vec<ParsedProxy>, Vec<ProxyLineError>) {
    let entries: Vec<&str> = if text.contains(';') {
        text.trim().split(';').collect()
    } else {
        text.trim().lines().collect()
    };

    let mut parsed = Vec::new();
    let mut errors = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let entry = entry.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        match parse_proxy_line(entry) {
            Ok(proxy) => parsed.push(proxy),
            Err(error) => errors.push(ProxyLineError {
                line: index + 1,
                input: entry.chars().take(50).collect(),
                error,
            }),
        }
    }
    (parsed, errors)
}

fn parse_url_form(line: &str) -> Result<ParsedProxy, ProxyParseError> {
    let (scheme_text, _) = line.split_once("://").ok_or(ProxyParseError::Format)?;
    let scheme: ProxyScheme = scheme_text
        .parse()
        .map_err(|_| ProxyParseError::UnsupportedScheme(scheme_text.to_ascii_lowercase()))?;

    let url = Url::parse(line).map_err(|_| ProxyParseError::Format)?;
    let host = url.host_str().ok_or(ProxyParseError::MissingHost)?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProxyParseError::InvalidPort(String::new()))?;
    let username = Some(url.username()).filter(|value| !value.is_empty());
    let password = url.password();
    build(scheme, host, port, username, password)
}

fn split_host_port(server: &str) -> Result<(&str, u16), ProxyParseError> {
    let (host, port) = server.rsplit_once(':').ok_or(ProxyParseError::Format)?;
    Ok((host, parse_port(port)?))
}

fn parse_port(value: &str) -> Result<u16, ProxyParseError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ProxyParseError::InvalidPort(value.trim().to_string())),
    }
}

fn build(
    scheme: ProxyScheme,
    host: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<ParsedProxy, ProxyParseError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ProxyParseError::MissingHost);
    }
    let username = username.map(str::trim).filter(|value| !value.is_empty());
    let password = password.map(str::trim).filter(|value| !value.is_empty());
    if username.is_some() != password.is_some() {
        return Err(ProxyParseError::IncompleteCredentials);
    }

    Ok(ParsedProxy {
        scheme,
        host: host.to_string(),
        port,
        username: username.map(str::to_string),
        password: password.map(str::to_string),
    })
}
