// src/config.rs
use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use dotenv::dotenv;
use thiserror::Error;

use crate::rabbitmq::{ChannelConfig, QueueSpec, RetryPolicy};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Invalid route '{0}', expected '/prefix=http://host:port'")]
    InvalidRoute(String),
}

fn default_uri() -> String {
    "amqp://rabbitmq:5672".to_string()
}

fn default_routes() -> &'static str {
    "/auth=http://auth:3000,/products=http://product:3001,/orders=http://order:3002"
}

/// Typed access to configuration values coming from `lookup`.
struct Source<F> {
    lookup: F,
}

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: &str) -> String {
        (self.lookup)(key)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn optional<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            Some(value) if !value.trim().is_empty() => {
                let parsed = value.trim().parse::<T>();
                parsed.map(Some).map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value,
                    reason: e.to_string(),
                })
            }
            _ => Ok(None),
        }
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    fn port(&self, default: u16) -> Result<SocketAddr, ConfigError> {
        let port = self.parse("PORT", default)?;
        Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }
}

fn invalid(key: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Longest accepted reconnect delay, one day.
const MAX_DELAY_SECS: u64 = 24 * 60 * 60;

fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub uri: String,
    pub retry: RetryPolicy,
    pub channel: ChannelConfig,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = Source { lookup };
        let defaults = RetryPolicy::default();

        let initial_delay = source.parse(
            "RABBITMQ_INITIAL_DELAY_SECS",
            defaults.initial_delay.as_secs(),
        )?;
        let retry_delay =
            source.parse("RABBITMQ_RETRY_DELAY_SECS", defaults.retry_delay.as_secs())?;
        let multiplier = source.parse("RABBITMQ_BACKOFF_MULTIPLIER", defaults.multiplier)?;
        let max_delay =
            source.parse("RABBITMQ_MAX_RETRY_DELAY_SECS", defaults.max_delay.as_secs())?;
        let jitter = source.parse("RABBITMQ_RETRY_JITTER", defaults.jitter)?;

        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(invalid(
                "RABBITMQ_BACKOFF_MULTIPLIER",
                multiplier,
                "must be at least 1.0",
            ));
        }
        for (key, secs) in [
            ("RABBITMQ_INITIAL_DELAY_SECS", initial_delay),
            ("RABBITMQ_RETRY_DELAY_SECS", retry_delay),
            ("RABBITMQ_MAX_RETRY_DELAY_SECS", max_delay),
        ] {
            if secs > MAX_DELAY_SECS {
                return Err(invalid(key, secs, "must be at most 86400 seconds"));
            }
        }
        if !(0.0..=0.5).contains(&jitter) {
            return Err(invalid(
                "RABBITMQ_RETRY_JITTER",
                jitter,
                "must be between 0.0 and 0.5",
            ));
        }

        let retry = RetryPolicy::fixed(
            Duration::from_secs(initial_delay),
            Duration::from_secs(retry_delay),
        )
        .with_backoff(multiplier, Duration::from_secs(max_delay))
        .with_jitter(jitter);

        Ok(Self {
            uri: source.string("RABBITMQ_URI", &default_uri()),
            retry,
            channel: ChannelConfig {
                prefetch_count: source.optional("RABBITMQ_PREFETCH_COUNT")?,
            },
        })
    }
}

/// Hides the password of an AMQP URI for logging.
pub fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    match authority.rsplit_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{}://{}:***@{}{}", scheme, user, host, path)
        }
        None => uri.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderServiceConfig {
    pub broker: BrokerConfig,
    pub listen_addr: SocketAddr,
    pub orders_queue: QueueSpec,
    pub products_queue: QueueSpec,
}

impl OrderServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String> + Copy,
    {
        let source = Source { lookup };
        let mut orders_queue = QueueSpec::durable(source.string("ORDERS_QUEUE", "orders"));
        if let Some(dead_letter) = source.optional::<String>("ORDERS_DEAD_LETTER_QUEUE")? {
            orders_queue = orders_queue.with_dead_letter(dead_letter);
        }

        Ok(Self {
            broker: BrokerConfig::from_lookup(lookup)?,
            listen_addr: source.port(3002)?,
            orders_queue,
            products_queue: QueueSpec::durable(source.string("PRODUCTS_QUEUE", "products")),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductServiceConfig {
    pub broker: BrokerConfig,
    pub listen_addr: SocketAddr,
    pub orders_queue: QueueSpec,
    pub products_queue: QueueSpec,
}

impl ProductServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String> + Copy,
    {
        let source = Source { lookup };
        // must match the order service's declaration or the broker refuses it
        let mut orders_queue = QueueSpec::durable(source.string("ORDERS_QUEUE", "orders"));
        if let Some(dead_letter) = source.optional::<String>("ORDERS_DEAD_LETTER_QUEUE")? {
            orders_queue = orders_queue.with_dead_letter(dead_letter);
        }

        Ok(Self {
            broker: BrokerConfig::from_lookup(lookup)?,
            listen_addr: source.port(3001)?,
            orders_queue,
            products_queue: QueueSpec::durable(source.string("PRODUCTS_QUEUE", "products")),
        })
    }
}

/// One gateway route: requests under `prefix` go to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub routes: Vec<Route>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = Source { lookup };
        Ok(Self {
            listen_addr: source.port(3003)?,
            routes: parse_routes(&source.string("GATEWAY_ROUTES", default_routes()))?,
        })
    }
}

/// Parses `"/a=http://x:1,/b=http://y:2"`.
pub fn parse_routes(raw: &str) -> Result<Vec<Route>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (prefix, target) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidRoute(entry.to_string()))?;
            let prefix = prefix.trim().trim_end_matches('/');
            let target = target.trim().trim_end_matches('/');

            if !prefix.starts_with('/')
                || !(target.starts_with("http://") || target.starts_with("https://"))
            {
                return Err(ConfigError::InvalidRoute(entry.to_string()));
            }
            Ok(Route {
                prefix: prefix.to_string(),
                target: target.to_string(),
            })
        })
        .collect()
}
