//! Client configuration loading (spec §6.3). All from environment
//! variables; `CLIENT_ID`, `REMOTE_URL`, and `LOCAL_URL` are required.

use std::time::Duration;

/// Floor imposed on `PING_INTERVAL` (spec §4.7, §8 invariant 5).
const MIN_PING_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Config {
    pub client_id: String,
    /// Base URL of the tunnel server, e.g. `wss://tunnel.example.com`.
    pub remote_url: String,
    /// Base URL of the local origin this client forwards requests to.
    pub local_url: url::Url,
    pub conn_token: Option<String>,
    pub ping_interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid LOCAL_URL '{0}': {1}")]
    InvalidLocalUrl(String, url::ParseError),
    #[error("invalid PING_INTERVAL '{0}': not a whole number of seconds")]
    InvalidPingInterval(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_iter(std::env::vars())
    }

    pub fn from_iter<I: IntoIterator<Item = (String, String)>>(
        vars: I,
    ) -> Result<Self, ConfigError> {
        let mut client_id = None;
        let mut remote_url = None;
        let mut local_url_raw = None;
        let mut conn_token = None;
        let mut ping_interval_raw = None;

        for (k, v) in vars {
            match k.as_str() {
                "CLIENT_ID" => client_id = Some(v),
                "REMOTE_URL" => remote_url = Some(v),
                "LOCAL_URL" => local_url_raw = Some(v),
                "CONN_TOKEN" => conn_token = Some(v),
                "PING_INTERVAL" => ping_interval_raw = Some(v),
                _ => {}
            }
        }

        let client_id = client_id.ok_or(ConfigError::Missing("CLIENT_ID"))?;
        let remote_url = remote_url.ok_or(ConfigError::Missing("REMOTE_URL"))?;
        let local_url_raw = local_url_raw.ok_or(ConfigError::Missing("LOCAL_URL"))?;
        let local_url = url::Url::parse(&local_url_raw)
            .map_err(|e| ConfigError::InvalidLocalUrl(local_url_raw.clone(), e))?;

        let ping_interval = match ping_interval_raw {
            None => DEFAULT_PING_INTERVAL,
            Some(raw) => {
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| ConfigError::InvalidPingInterval(raw.clone()))?;
                clamp_ping_interval(Duration::from_secs(secs))
            }
        };

        Ok(Config {
            client_id,
            remote_url,
            local_url,
            conn_token,
            ping_interval,
        })
    }
}

/// `PING_INTERVAL` values below 5s are clamped to 5s (spec §8 invariant 5).
pub fn clamp_ping_interval(requested: Duration) -> Duration {
    requested.max(MIN_PING_INTERVAL)
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

    fn required() -> Vec<(String, String)> {
        vars(&[
            ("CLIENT_ID", "c1"),
            ("REMOTE_URL", "wss://tunnel.example.com"),
            ("LOCAL_URL", "http://127.0.0.1:3000"),
        ])
    }

    #[test]
    fn missing_required_vars_are_rejected() {
        assert!(matches!(
            Config::from_iter(vars(&[])),
            Err(ConfigError::Missing("CLIENT_ID"))
        ));
    }

    #[test]
    fn defaults_ping_interval_to_30s() {
        let cfg = Config::from_iter(required()).unwrap();
        assert_eq!(cfg.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn ping_interval_below_5s_is_clamped() {
        let mut pairs = required();
        pairs.push(("PING_INTERVAL".into(), "2".into()));
        let cfg = Config::from_iter(pairs).unwrap();
        assert_eq!(cfg.ping_interval, Duration::from_secs(5));
    }

    #[test]
    fn ping_interval_above_floor_is_kept() {
        let mut pairs = required();
        pairs.push(("PING_INTERVAL".into(), "45".into()));
        let cfg = Config::from_iter(pairs).unwrap();
        assert_eq!(cfg.ping_interval, Duration::from_secs(45));
    }

    #[test]
    fn invalid_local_url_is_rejected() {
        let mut pairs = required();
        pairs.retain(|(k, _)| k != "LOCAL_URL");
        pairs.push(("LOCAL_URL".into(), "not a url".into()));
        assert!(matches!(
            Config::from_iter(pairs),
            Err(ConfigError::InvalidLocalUrl(_, _))
        ));
    }
}
