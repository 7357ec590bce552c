use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};

/// The address of a broker. Addresses are compared by identity (host and port as given), no name
///  resolution takes place here - that is the transport's business when it establishes a
///  connection.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

impl BrokerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> BrokerAddr {
        BrokerAddr {
            host: host.into(),
            port,
        }
    }
}

impl Debug for BrokerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Display for BrokerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BrokerAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // NB: IPv6 literals are bracketed, so the port separator is always the last colon
        let (host, port) = s.rsplit_once(':')
            .ok_or_else(|| anyhow!("broker address {:?} has no port", s))?;
        if host.is_empty() {
            bail!("broker address {:?} has no host", s);
        }
        let port = port.parse::<u16>()
            .map_err(|e| anyhow!("broker address {:?} has an invalid port: {}", s, e))?;
        Ok(BrokerAddr::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::name("localhost:5672", Some(BrokerAddr::new("localhost", 5672)))]
    #[case::ipv4("127.0.0.1:5677", Some(BrokerAddr::new("127.0.0.1", 5677)))]
    #[case::ipv6("[::1]:5672", Some(BrokerAddr::new("[::1]", 5672)))]
    #[case::no_port("localhost", None)]
    #[case::no_host(":5672", None)]
    #[case::bad_port("localhost:99999", None)]
    fn test_parse(#[case] s: &str, #[case] expected: Option<BrokerAddr>) {
        assert_eq!(s.parse::<BrokerAddr>().ok(), expected);
    }

    #[test]
    fn test_display() {
        assert_eq!(BrokerAddr::new("broker-1", 5672).to_string(), "broker-1:5672");
    }
}
