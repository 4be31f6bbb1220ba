use serde::Deserialize;

/// Broker configuration. Loading this from files or the environment is the
/// caller's concern; the broker only consumes the resolved value.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection string, e.g. `redis://host:6379` or `rediss://...`.
    pub broker: String,
    /// Logical queue name `Q`; the `Q_delayed` and `Q_detail` keys derive
    /// from it.
    pub default_queue: String,
    /// Carried for the result-backend layer; unused by the broker core.
    pub result_backend: Option<String>,
    /// Unix socket path. When set it overrides the host in `broker`.
    pub socket_path: Option<String>,
    pub pool_size: usize,
    pub no_unix_signals: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: "redis://127.0.0.1:6379/".to_string(),
            default_queue: "tasks".to_string(),
            result_backend: None,
            socket_path: None,
            pool_size: 10,
            no_unix_signals: false,
        }
    }
}

impl Config {
    pub fn new(broker: impl Into<String>, default_queue: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            default_queue: default_queue.into(),
            ..Default::default()
        }
    }

    /// The URL handed to the redis client: the configured socket path wins
    /// over the broker host.
    pub fn connection_url(&self) -> String {
        match &self.socket_path {
            Some(path) => format!("redis+unix://{path}"),
            None => self.broker.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.broker, "redis://127.0.0.1:6379/");
        assert_eq!(config.default_queue, "tasks");
        assert_eq!(config.pool_size, 10);
        assert!(!config.no_unix_signals);
    }

    #[test]
    fn deserializes_partial_input() {
        let config: Config =
            serde_json::from_str(r#"{"broker":"redis://redis.internal:6380","default_queue":"jobs"}"#)
                .unwrap();
        assert_eq!(config.broker, "redis://redis.internal:6380");
        assert_eq!(config.default_queue, "jobs");
        assert_eq!(config.result_backend, None);
    }

    #[test]
    fn socket_path_overrides_host() {
        let mut config = Config::default();
        assert_eq!(config.connection_url(), "redis://127.0.0.1:6379/");

        config.socket_path = Some("/var/run/redis.sock".to_string());
        assert_eq!(config.connection_url(), "redis+unix:///var/run/redis.sock");
    }
}
