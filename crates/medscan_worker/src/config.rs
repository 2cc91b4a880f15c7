use common::mqtt::{
    qos_from_level, validate_publish_topic, validate_subscribe_filter, MqttConnectionConfig,
    DEFAULT_MAX_PACKET_SIZE,
};
use common::telemetry::{LogFormat, TelemetryConfig};
use config::{Config, ConfigError, Environment};
use detection_worker::GeminiConfig;
use secrecy::Secret;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

#[derive(Deserialize, Clone)]
pub struct ServiceConfig {
    // MQTT configuration
    /// Broker host, optionally `scheme://host:port`
    #[serde(default = "default_mqtt_broker")]
    pub mqtt_broker: String,

    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,

    /// Broker username (required)
    #[serde(default)]
    pub mqtt_username: Option<String>,

    /// Broker password (required)
    #[serde(default)]
    pub mqtt_password: Option<String>,

    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,

    /// Use TLS for the broker connection
    #[serde(default = "default_true")]
    pub mqtt_tls_enabled: bool,

    /// Skip broker certificate validation
    #[serde(default = "default_true")]
    pub mqtt_tls_insecure: bool,

    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub mqtt_keep_alive_secs: u64,

    /// QoS for both the input subscription and output publishes (0, 1 or 2)
    #[serde(default)]
    pub mqtt_qos: u8,

    #[serde(default = "default_mqtt_reconnect_delay_secs")]
    pub mqtt_reconnect_delay_secs: u64,

    /// Largest MQTT packet in bytes, incoming or outgoing
    #[serde(default = "default_mqtt_max_packet_size")]
    pub mqtt_max_packet_size: usize,

    // Topics
    /// Input topic carrying base64 images (required)
    #[serde(default)]
    pub topic_main: Option<String>,

    /// Output topic for detection results (required)
    #[serde(default)]
    pub topic_detection: Option<String>,

    // Gemini configuration
    /// API key; the worker runs without an analyzer when unset
    #[serde(default)]
    pub gemini_api_key: Option<String>,

    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    #[serde(default = "default_gemini_api_base")]
    pub gemini_api_base: String,

    #[serde(default = "default_gemini_timeout_secs")]
    pub gemini_timeout_secs: u64,

    // Telemetry configuration
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Console log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default)]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    /// Upper bound on cleanup after a shutdown signal
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("mqtt_broker", &self.mqtt_broker)
            .field("mqtt_port", &self.mqtt_port)
            .field("mqtt_username", &self.mqtt_username)
            .field("mqtt_password", &self.mqtt_password.as_ref().map(|_| "[redacted]"))
            .field("mqtt_client_id", &self.mqtt_client_id)
            .field("mqtt_tls_enabled", &self.mqtt_tls_enabled)
            .field("mqtt_tls_insecure", &self.mqtt_tls_insecure)
            .field("mqtt_keep_alive_secs", &self.mqtt_keep_alive_secs)
            .field("mqtt_qos", &self.mqtt_qos)
            .field("mqtt_reconnect_delay_secs", &self.mqtt_reconnect_delay_secs)
            .field("mqtt_max_packet_size", &self.mqtt_max_packet_size)
            .field("topic_main", &self.topic_main)
            .field("topic_detection", &self.topic_detection)
            .field("gemini_api_key", &self.gemini_api_key.as_ref().map(|_| "[redacted]"))
            .field("gemini_model", &self.gemini_model)
            .field("gemini_api_base", &self.gemini_api_base)
            .field("gemini_timeout_secs", &self.gemini_timeout_secs)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("otel_enabled", &self.otel_enabled)
            .field("otel_endpoint", &self.otel_endpoint)
            .field("otel_service_name", &self.otel_service_name)
            .field("shutdown_timeout_secs", &self.shutdown_timeout_secs)
            .finish()
    }
}

fn default_mqtt_broker() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_mqtt_client_id() -> String {
    "Heroku_Worker_001".to_string()
}

fn default_true() -> bool {
    true
}

fn default_mqtt_keep_alive_secs() -> u64 {
    60
}

fn default_mqtt_reconnect_delay_secs() -> u64 {
    5
}

fn default_mqtt_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

fn default_gemini_model() -> String {
    detection_worker::DEFAULT_GEMINI_MODEL.to_string()
}

fn default_gemini_api_base() -> String {
    detection_worker::DEFAULT_GEMINI_API_BASE.to_string()
}

fn default_gemini_timeout_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "medscan-worker".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

/// Treat unset and blank values the same
fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, ConfigError> {
    non_blank(value).ok_or_else(|| ConfigError::NotFound(name.to_string()))
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(Environment::default())
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject missing credentials or topics and out-of-range values
    pub fn validate(&self) -> Result<(), ConfigError> {
        required(&self.mqtt_username, "MQTT_USERNAME")?;
        required(&self.mqtt_password, "MQTT_PASSWORD")?;
        let input_topic = required(&self.topic_main, "TOPIC_MAIN")?;
        let output_topic = required(&self.topic_detection, "TOPIC_DETECTION")?;

        validate_subscribe_filter(input_topic)
            .map_err(|e| ConfigError::Message(format!("TOPIC_MAIN: {}", e)))?;
        validate_publish_topic(output_topic)
            .map_err(|e| ConfigError::Message(format!("TOPIC_DETECTION: {}", e)))?;

        if self.mqtt_client_id.trim().is_empty() {
            return Err(ConfigError::Message(
                "MQTT_CLIENT_ID cannot be empty".to_string(),
            ));
        }

        if self.mqtt_max_packet_size == 0 {
            return Err(ConfigError::Message(
                "MQTT_MAX_PACKET_SIZE must be greater than zero".to_string(),
            ));
        }

        qos_from_level(self.mqtt_qos).map_err(|e| ConfigError::Message(e.to_string()))?;
        self.log_format
            .parse::<LogFormat>()
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        Ok(())
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.otel_service_name.clone(),
            otel_endpoint: self.otel_endpoint.clone(),
            otel_enabled: self.otel_enabled,
            log_level: self.log_level.clone(),
            log_format: self.log_format.parse().unwrap_or_default(),
        }
    }

    pub fn mqtt_connection_config(&self) -> MqttConnectionConfig {
        MqttConnectionConfig {
            broker: self.mqtt_broker.trim().to_string(),
            port: self.mqtt_port,
            client_id: self.mqtt_client_id.trim().to_string(),
            username: non_blank(&self.mqtt_username).unwrap_or_default().to_string(),
            password: self.mqtt_password.clone().unwrap_or_default(),
            keep_alive_secs: self.mqtt_keep_alive_secs,
            tls_enabled: self.mqtt_tls_enabled,
            tls_insecure: self.mqtt_tls_insecure,
            max_packet_size: self.mqtt_max_packet_size,
        }
    }

    pub fn input_topic(&self) -> String {
        non_blank(&self.topic_main).unwrap_or_default().to_string()
    }

    pub fn output_topic(&self) -> String {
        non_blank(&self.topic_detection).unwrap_or_default().to_string()
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.mqtt_reconnect_delay_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Gemini settings, or `None` when no API key is configured
    pub fn gemini_config(&self) -> Option<GeminiConfig> {
        non_blank(&self.gemini_api_key).map(|key| GeminiConfig {
            api_key: Secret::new(key.to_string()),
            model: self.gemini_model.clone(),
            base_url: self.gemini_api_base.clone(),
            request_timeout: Duration::from_secs(self.gemini_timeout_secs),
        })
    }
}
