use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};

use crate::failover::failover_config::FailoverConfig;
use crate::meta::resource_info::Destination;
use crate::provider::broker_addr::BrokerAddr;

/// Number of messages a consumer asks the broker to send ahead of receive calls. Zero means the
///  consumer pulls messages one at a time.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PrefetchPolicy {
    pub queue: u32,
    pub topic: u32,
    pub durable_topic: u32,
    pub queue_browser: u32,
}

impl Default for PrefetchPolicy {
    fn default() -> Self {
        PrefetchPolicy {
            queue: 1000,
            topic: 1000,
            durable_topic: 1000,
            queue_browser: 1000,
        }
    }
}

impl PrefetchPolicy {
    pub fn set_all(&mut self, value: u32) {
        self.queue = value;
        self.topic = value;
        self.durable_topic = value;
        self.queue_browser = value;
    }

    pub fn prefetch_for(&self, destination: &Destination, durable: bool, browser: bool) -> u32 {
        if browser {
            self.queue_browser
        }
        else if durable {
            self.durable_topic
        }
        else if destination.is_topic() {
            self.topic
        }
        else {
            self.queue
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub failover: FailoverConfig,
    pub prefetch: PrefetchPolicy,
    /// deliver buffered messages by priority rather than in arrival order
    pub local_message_priority: bool,
    /// `None` waits for broker responses without limit
    pub request_timeout: Option<Duration>,
    pub client_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ClientConfig {
    pub fn new(addresses: Vec<BrokerAddr>) -> ClientConfig {
        ClientConfig {
            failover: FailoverConfig::new(addresses),
            prefetch: Default::default(),
            local_message_priority: false,
            request_timeout: Some(Duration::from_secs(60)),
            client_id: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.failover.validate()?;
        if let Some(client_id) = &self.client_id {
            if client_id.trim().is_empty() {
                bail!("client id must not be blank");
            }
        }
        Ok(())
    }

    /// Parses a connection URI of the forms
    ///
    /// * `amqp://host:port?options`
    /// * `failover:(amqp://host1:port1,amqp://host2:port2)?options`
    /// * `discovery:(agent-uri)?options` - the agent is set up by the application, so this only
    ///   contributes options
    pub fn from_uri(uri: &str) -> anyhow::Result<ClientConfig> {
        let (main, query) = split_query(uri);

        let addresses = if let Some(nested) = main.strip_prefix("failover:") {
            parse_nested(nested)?
                .iter()
                .map(|u| parse_broker_uri(u))
                .collect::<anyhow::Result<Vec<_>>>()?
        }
        else if let Some(nested) = main.strip_prefix("discovery:") {
            parse_nested(nested)?;
            Vec::new()
        }
        else {
            vec![parse_broker_uri(main)?]
        };

        let mut options = Vec::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=')
                    .ok_or_else(|| anyhow!("option without value: {}", pair))?;
                options.push((key, value));
            }
        }

        let mut result = ClientConfig::new(addresses);
        result.apply_options(options)?;
        Ok(result)
    }

    /// Builds a configuration from key / value options, see [ClientConfig::apply_options]
    pub fn from_options<'a>(options: impl IntoIterator<Item = (&'a str, &'a str)>) -> anyhow::Result<ClientConfig> {
        let mut result = ClientConfig::default();
        result.apply_options(options)?;
        Ok(result)
    }

    /// Applies options by name. Keys may carry a `failover.`, `discovery.` or `jms.` prefix,
    ///  unknown keys are an error.
    pub fn apply_options<'a>(&mut self, options: impl IntoIterator<Item = (&'a str, &'a str)>) -> anyhow::Result<()> {
        for (key, value) in options {
            self.apply_option(key, value)
                .with_context(|| format!("invalid option {}={}", key, value))?;
        }
        self.validate()
    }

    fn apply_option(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let key = ["failover.", "discovery.", "jms."].iter()
            .find_map(|prefix| key.strip_prefix(prefix))
            .unwrap_or(key);

        let failover = &mut self.failover;
        match key {
            "startupMaxReconnectAttempts" => failover.startup_max_reconnect_attempts = parse(value)?,
            "maxReconnectAttempts" => failover.max_reconnect_attempts = parse(value)?,
            "initialReconnectDelay" => failover.initial_reconnect_delay = parse_millis(value)?,
            "reconnectDelay" => failover.reconnect_delay = parse_millis(value)?,
            "maxReconnectDelay" => failover.max_reconnect_delay = parse_millis(value)?,
            "useReconnectBackOff" => failover.use_reconnect_backoff = parse(value)?,
            "reconnectBackOffMultiplier" => failover.reconnect_backoff_multiplier = parse(value)?,
            "randomize" => failover.randomize_candidates = parse(value)?,
            "connectTimeout" => failover.connect_timeout = parse_millis(value)?,
            "followRedirects" => failover.follow_redirects = parse(value)?,
            "prefetchPolicy.queuePrefetch" => self.prefetch.queue = parse(value)?,
            "prefetchPolicy.topicPrefetch" => self.prefetch.topic = parse(value)?,
            "prefetchPolicy.durableTopicPrefetch" => self.prefetch.durable_topic = parse(value)?,
            "prefetchPolicy.queueBrowserPrefetch" => self.prefetch.queue_browser = parse(value)?,
            "prefetchPolicy.all" => self.prefetch.set_all(parse(value)?),
            "localMessagePriority" => self.local_message_priority = parse(value)?,
            "requestTimeout" => {
                let millis: i64 = parse(value)?;
                self.request_timeout = u64::try_from(millis).ok()
                    .filter(|m| *m > 0)
                    .map(Duration::from_millis);
            }
            "clientID" => self.client_id = Some(value.to_string()),
            _ => bail!("unknown option {}", key),
        }
        Ok(())
    }
}

fn parse<T: FromStr>(value: &str) -> anyhow::Result<T>
where <T as FromStr>::Err: std::error::Error + Send + Sync + 'static
{
    Ok(value.trim().parse::<T>()?)
}

fn parse_millis(value: &str) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(parse::<u64>(value)?))
}

/// splits at the first '?' that is not inside parentheses
fn split_query(uri: &str) -> (&str, Option<&str>) {
    let mut depth = 0i32;
    for (i, c) in uri.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            '?' if depth == 0 => return (&uri[..i], Some(&uri[i + 1..])),
            _ => {}
        }
    }
    (uri, None)
}

fn parse_nested(nested: &str) -> anyhow::Result<Vec<&str>> {
    let inner = nested.trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| anyhow!("nested URIs must be enclosed in parentheses: {}", nested))?;

    let result = inner.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    if result.is_empty() {
        bail!("no nested URIs in {}", nested);
    }
    Ok(result)
}

fn parse_broker_uri(uri: &str) -> anyhow::Result<BrokerAddr> {
    let (main, _) = split_query(uri);
    let authority = main.split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(main)
        .trim_end_matches('/');
    authority.parse()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;
    use crate::failover::failover_config::InterruptedRequestPolicy;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.prefetch, PrefetchPolicy { queue: 1000, topic: 1000, durable_topic: 1000, queue_browser: 1000 });
        assert_eq!(config.request_timeout, Some(Duration::from_secs(60)));
        assert!(!config.local_message_priority);
        assert_eq!(config.failover.startup_max_reconnect_attempts, -1);
        assert_eq!(config.failover.resource_requests_while_interrupted, InterruptedRequestPolicy::QueueUntilRestored);
        assert_eq!(config.failover.one_shot_requests_while_interrupted, InterruptedRequestPolicy::FailFast);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_options() {
        let config = ClientConfig::from_options([
            ("discovery.startupMaxReconnectAttempts", "10"),
            ("discovery.maxReconnectDelay", "100"),
            ("failover.reconnectDelay", "5"),
            ("useReconnectBackOff", "false"),
            ("jms.prefetchPolicy.all", "0"),
            ("jms.prefetchPolicy.topicPrefetch", "7"),
            ("jms.localMessagePriority", "true"),
            ("jms.requestTimeout", "0"),
            ("jms.clientID", "my-client"),
        ]).unwrap();

        assert_eq!(config.failover.startup_max_reconnect_attempts, 10);
        assert_eq!(config.failover.max_reconnect_delay, Duration::from_millis(100));
        assert_eq!(config.failover.reconnect_delay, Duration::from_millis(5));
        assert!(!config.failover.use_reconnect_backoff);
        assert_eq!(config.prefetch, PrefetchPolicy { queue: 0, topic: 7, durable_topic: 0, queue_browser: 0 });
        assert!(config.local_message_priority);
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.client_id.as_deref(), Some("my-client"));
    }

    #[rstest]
    #[case::unknown_key(("failover.noSuchOption", "1"))]
    #[case::not_a_number(("maxReconnectAttempts", "many"))]
    #[case::not_a_bool(("randomize", "maybe"))]
    #[case::invalid_combination(("reconnectBackOffMultiplier", "0.5"))]
    #[case::blank_client_id(("clientID", " "))]
    fn test_from_options_invalid(#[case] option: (&str, &str)) {
        assert!(ClientConfig::from_options([option]).is_err());
    }

    #[test]
    fn test_from_failover_uri() {
        let config = ClientConfig::from_uri("failover:(amqp://broker1:5672,amqp://broker2:5673?amqp.idleTimeout=1)?failover.maxReconnectAttempts=3&jms.prefetchPolicy.queuePrefetch=10").unwrap();

        assert_eq!(config.failover.static_addresses, vec![BrokerAddr::new("broker1", 5672), BrokerAddr::new("broker2", 5673)]);
        assert_eq!(config.failover.max_reconnect_attempts, 3);
        assert_eq!(config.prefetch.queue, 10);
    }

    #[test]
    fn test_from_discovery_uri() {
        let config = ClientConfig::from_uri("discovery:(multicast://default?group=altGroup)?discovery.startupMaxReconnectAttempts=10&discovery.maxReconnectDelay=100").unwrap();

        assert!(config.failover.static_addresses.is_empty());
        assert_eq!(config.failover.startup_max_reconnect_attempts, 10);
        assert_eq!(config.failover.max_reconnect_delay, Duration::from_millis(100));
    }

    #[rstest]
    #[case::plain("amqp://localhost:5672", "localhost", 5672)]
    #[case::trailing_slash("amqp://localhost:5672/", "localhost", 5672)]
    #[case::with_query("amqps://broker:5671?transport.verifyHost=false", "broker", 5671)]
    fn test_from_broker_uri(#[case] uri: &str, #[case] host: &str, #[case] port: u16) {
        let config = ClientConfig::from_uri(uri).unwrap();
        assert_eq!(config.failover.static_addresses, vec![BrokerAddr::new(host, port)]);
    }

    #[rstest]
    #[case::no_parentheses("failover:amqp://broker1:5672")]
    #[case::empty("failover:()")]
    #[case::no_port("amqp://localhost")]
    #[case::option_without_value("amqp://localhost:5672?randomize")]
    fn test_from_uri_invalid(#[case] uri: &str) {
        assert!(ClientConfig::from_uri(uri).is_err());
    }
}
