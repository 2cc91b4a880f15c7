use crate::mqtt::insecure_tls_client_config;
use anyhow::{bail, Context};
use rumqttc::{MqttOptions, QoS, TlsConfiguration, Transport};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Largest MQTT packet accepted or sent; base64 camera photos run to megabytes
pub const DEFAULT_MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Connection settings for a single MQTT broker session
#[derive(Clone)]
pub struct MqttConnectionConfig {
    /// Broker host, optionally with scheme and port (`mqtts://host:8883`)
    pub broker: String,
    /// Port used when `broker` does not carry one
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u64,
    pub tls_enabled: bool,
    /// Skip server certificate validation when TLS is enabled
    pub tls_insecure: bool,
    /// Packet size limit in bytes, applied to both directions
    pub max_packet_size: usize,
}

impl fmt::Debug for MqttConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConnectionConfig")
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("tls_enabled", &self.tls_enabled)
            .field("tls_insecure", &self.tls_insecure)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

/// Build rumqttc options (credentials, keep-alive, transport) from config
pub fn build_mqtt_options(config: &MqttConnectionConfig) -> anyhow::Result<MqttOptions> {
    if config.client_id.trim().is_empty() {
        bail!("MQTT client id cannot be empty");
    }

    let (host, port) = parse_broker_address(&config.broker, config.port)?;

    let mut options = MqttOptions::new(config.client_id.clone(), host, port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(1)));
    options.set_clean_session(true);
    options.set_credentials(config.username.clone(), config.password.clone());
    options.set_max_packet_size(config.max_packet_size, config.max_packet_size);

    let transport = match (config.tls_enabled, config.tls_insecure) {
        (false, _) => Transport::tcp(),
        (true, true) => {
            warn!(
                host = %host,
                "TLS certificate validation disabled for MQTT broker connection"
            );
            Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(
                insecure_tls_client_config(),
            )))
        }
        (true, false) => Transport::tls_with_default_config(),
    };
    options.set_transport(transport);

    debug!(
        host = %host,
        port,
        client_id = %config.client_id,
        tls = config.tls_enabled,
        "built MQTT options"
    );

    Ok(options)
}

/// Parse broker address in format `mqtts://host:port`, `tcp://host:port`, `host:port` or `host`
pub fn parse_broker_address(address: &str, default_port: u16) -> anyhow::Result<(&str, u16)> {
    let address = ["mqtts://", "mqtt://", "ssl://", "tls://", "tcp://"]
        .iter()
        .fold(address.trim(), |acc, scheme| acc.trim_start_matches(scheme));

    let parts: Vec<&str> = address.split(':').collect();
    match parts.as_slice() {
        [host] if !host.is_empty() => Ok((*host, default_port)),
        [host, port] if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid port in broker address: {}", port))?;
            Ok((*host, port))
        }
        _ => bail!("Invalid broker address format: {}", address),
    }
}

/// Check a subscription filter; wildcards are allowed
pub fn validate_subscribe_filter(filter: &str) -> anyhow::Result<()> {
    if filter.is_empty() || !rumqttc::valid_filter(filter) {
        bail!("Invalid MQTT subscription filter: {:?}", filter);
    }
    Ok(())
}

/// Check a publish topic; wildcards are not allowed
pub fn validate_publish_topic(topic: &str) -> anyhow::Result<()> {
    if topic.is_empty() || !rumqttc::valid_topic(topic) {
        bail!("Invalid MQTT publish topic: {:?}", topic);
    }
    Ok(())
}

/// Map a numeric QoS level (0, 1, 2) to the rumqttc enum
pub fn qos_from_level(level: u8) -> anyhow::Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => bail!("Invalid MQTT QoS level {}: expected 0, 1 or 2", other),
    }
}
