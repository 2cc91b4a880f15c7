mod config;

use common::mqtt::qos_from_level;
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use crate::config::ServiceConfig;
use detection_worker::{DetectionWorker, DetectionWorkerConfig, GeminiVisionModel, VisionModel};
use medscan_runner::Runner;
use std::sync::Arc;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    // Initialize configuration and tracing
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> =
        match init_telemetry(&config.telemetry_config()) {
            Ok(providers) => providers,
            Err(e) => {
                eprintln!("Failed to initialize telemetry: {}", e);
                std::process::exit(1);
            }
        };

    info!(
        broker = %config.mqtt_broker,
        port = config.mqtt_port,
        client_id = %config.mqtt_client_id,
        input_topic = %config.input_topic(),
        output_topic = %config.output_topic(),
        otel_enabled = config.otel_enabled,
        "Starting medscan worker"
    );
    debug!("Configuration: {:?}", config);

    let vision_model = create_vision_model(&config);

    let qos = match qos_from_level(config.mqtt_qos) {
        Ok(qos) => qos,
        Err(e) => {
            error!("Invalid MQTT QoS: {}", e);
            std::process::exit(1);
        }
    };

    let detection_worker = match DetectionWorker::new(
        DetectionWorkerConfig {
            mqtt: config.mqtt_connection_config(),
            input_topic: config.input_topic(),
            output_topic: config.output_topic(),
            qos,
            reconnect_delay: config.reconnect_delay(),
        },
        vision_model,
    ) {
        Ok(worker) => worker,
        Err(e) => {
            error!("Failed to initialize detection worker: {:#}", e);
            std::process::exit(1);
        }
    };

    Runner::new()
        .with_named_process("detection_worker", detection_worker.into_runner_process())
        .with_closer(move || async move {
            info!("Running cleanup tasks...");

            // Flush pending traces and logs
            shutdown_telemetry(telemetry_providers);

            info!("Cleanup complete");
            Ok(())
        })
        .with_closer_timeout(config.shutdown_timeout())
        .run()
        .await;
}

/// Build the Gemini backend, or `None` to run without an analyzer
fn create_vision_model(config: &ServiceConfig) -> Option<Arc<dyn VisionModel>> {
    let Some(gemini_config) = config.gemini_config() else {
        error!("GEMINI_API_KEY is not set, images will not be analyzed");
        return None;
    };

    match GeminiVisionModel::new(gemini_config) {
        Ok(model) => {
            info!(model = model.model(), "Gemini vision model configured");
            Some(Arc::new(model))
        }
        Err(e) => {
            error!(
                "Failed to configure Gemini client, images will not be analyzed: {:#}",
                e
            );
            None
        }
    }
}
