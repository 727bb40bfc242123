//! Vehicle server configuration

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Pre-allocated client id from a two-phase launch
    pub id: Option<String>,
    pub name: String,
    pub desc: String,
    /// Address the reply socket binds to and advertises
    pub ip: String,
    /// Reply socket port; 0 picks one from the range below
    pub port: u16,
    pub min_port: u16,
    pub max_port: u16,
    /// Broker endpoint; without one the vehicle runs standalone
    pub broker: Option<(String, u16)>,
    /// GCS heartbeat endpoint; without one the link counts as vital
    pub gcs: Option<(String, u16)>,
    pub capabilities: Vec<String>,
    /// Require a centered throttle stick for the clearance cycle
    pub midstick_check: bool,
    /// Speed flown when a waypoint does not name one, in m/s
    pub default_speed: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            name: "fleetlink-vehicle".into(),
            desc: String::new(),
            ip: "127.0.0.1".into(),
            port: 0,
            min_port: 5560,
            max_port: 5579,
            broker: None,
            gcs: None,
            capabilities: Vec::new(),
            midstick_check: true,
            default_speed: 5.0,
        }
    }
}

/// Split an `ip:port` endpoint argument
pub fn parse_endpoint(arg: &str) -> Result<(String, u16)> {
    let Some((ip, port)) = arg.rsplit_once(':') else {
        bail!("expected ip:port, got {arg:?}");
    };
    let port = port
        .parse::<u16>()
        .with_context(|| format!("bad port in {arg:?}"))?;
    Ok((ip.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("10.0.0.2:5556").unwrap(),
            ("10.0.0.2".into(), 5556)
        );
        assert!(parse_endpoint("10.0.0.2").is_err());
        assert!(parse_endpoint("10.0.0.2:banana").is_err());
    }
}
