//! Server configuration loading.
//!
//! All configuration comes from environment variables (spec §6.3); there is
//! no config file. Every variable is optional except none are strictly
//! required -- an unset `AUTH_TOKEN`/`CONN_TOKEN` simply disables that check.

use regex::Regex;
use std::net::SocketAddr;

/// Parsed, validated server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token required on the `/__connect__` tunnel handshake. `None`
    /// disables the check.
    pub conn_token: Option<String>,
    /// Bearer token required on public traffic. `None` disables the check.
    pub auth_token: Option<String>,
    /// Paths matching this pattern bypass `auth_token` entirely.
    pub auth_rule: Option<Regex>,
    /// If true, the original `host` header is forwarded untouched instead of
    /// being replaced with `x-forwarded-host`.
    pub forward_host: bool,
    /// If true, the dispatcher buffers the whole request body and sends a
    /// single `request` frame instead of streaming `header`/`body` frames.
    pub buffer_request: bool,
    /// Address the public HTTP(S)/WS listener binds to.
    pub bind_addr: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid AUTH_RULE regex: {0}")]
    InvalidAuthRule(#[from] regex::Error),
    #[error("invalid BIND_ADDR '{0}': {1}")]
    InvalidBindAddr(String, std::net::AddrParseError),
}

/// Case-insensitive `true|on|1` per spec §6.3.
fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "true" | "on" | "1")
}

/// Parse `/pattern/flags`-style regex literals (e.g. `/^\/health/i`), or
/// treat the whole string as a plain pattern if it isn't wrapped in slashes.
fn parse_auth_rule(raw: &str) -> Result<Regex, ConfigError> {
    if let Some(rest) = raw.strip_prefix('/') {
        if let Some(end) = rest.rfind('/') {
            let (pattern, flags) = rest.split_at(end);
            let flags = &flags[1..];
            let mut builder = regex::RegexBuilder::new(pattern);
            if flags.contains('i') {
                builder.case_insensitive(true);
            }
            return Ok(builder.build()?);
        }
    }
    Ok(Regex::new(raw)?)
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_iter(std::env::vars())
    }

    /// Load from an arbitrary key/value iterator (used by tests).
    pub fn from_iter<I: IntoIterator<Item = (String, String)>>(
        vars: I,
    ) -> Result<Self, ConfigError> {
        let mut conn_token = None;
        let mut auth_token = None;
        let mut auth_rule_raw = None;
        let mut forward_host = false;
        let mut buffer_request = false;
        let mut bind_addr_raw = None;

        for (k, v) in vars {
            match k.as_str() {
                "CONN_TOKEN" => conn_token = Some(v),
                "AUTH_TOKEN" => auth_token = Some(v),
                "AUTH_RULE" => auth_rule_raw = Some(v),
                "FORWARD_HOST" => forward_host = parse_bool(&v),
                "BUFFER_REQUEST" => buffer_request = parse_bool(&v),
                "BIND_ADDR" => bind_addr_raw = Some(v),
                _ => {}
            }
        }

        let auth_rule = auth_rule_raw.as_deref().map(parse_auth_rule).transpose()?;
        let bind_addr_raw = bind_addr_raw.unwrap_or_else(|| "0.0.0.0:8080".to_owned());
        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|e| ConfigError::InvalidBindAddr(bind_addr_raw.clone(), e))?;

        Ok(Config {
            conn_token,
            auth_token,
            auth_rule,
            forward_host,
            buffer_request,
            bind_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_permissive() {
        let cfg = Config::from_iter(vars(&[])).unwrap();
        assert!(cfg.conn_token.is_none());
        assert!(cfg.auth_token.is_none());
        assert!(!cfg.forward_host);
        assert!(!cfg.buffer_request);
        assert_eq!(cfg.bind_addr.to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn boolean_parsing_is_case_insensitive() {
        for v in ["true", "TRUE", "on", "ON", "1"] {
            let cfg = Config::from_iter(vars(&[("FORWARD_HOST", v)])).unwrap();
            assert!(cfg.forward_host, "{v} should parse as true");
        }
        for v in ["false", "0", "off", "nonsense"] {
            let cfg = Config::from_iter(vars(&[("FORWARD_HOST", v)])).unwrap();
            assert!(!cfg.forward_host, "{v} should parse as false");
        }
    }

    #[test]
    fn auth_rule_slash_syntax_with_flags() {
        let cfg = Config::from_iter(vars(&[("AUTH_RULE", "/^\\/public/i")])).unwrap();
        let re = cfg.auth_rule.unwrap();
        assert!(re.is_match("/PUBLIC/x"));
        assert!(!re.is_match("/private"));
    }

    #[test]
    fn invalid_bind_addr_is_rejected() {
        let err = Config::from_iter(vars(&[("BIND_ADDR", "not-an-addr")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBindAddr(_, _)));
    }
}
