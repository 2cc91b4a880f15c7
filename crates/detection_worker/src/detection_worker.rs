use crate::domain::{DetectionService, MedicineAnalyzer, VisionModel};
use crate::mqtt::{DetectionSubscriber, DetectionSubscriberConfig, MqttDetectionProducer};
use common::mqtt::{build_mqtt_options, MqttClientPublisher, MqttConnectionConfig};
use medscan_runner::{AppProcess, ProcessFuture};
use rumqttc::{AsyncClient, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Capacity of the request channel between client handles and the event loop
pub(crate) const MQTT_REQUEST_CAPACITY: usize = 10;

pub struct DetectionWorkerConfig {
    pub mqtt: MqttConnectionConfig,
    pub input_topic: String,
    pub output_topic: String,
    pub qos: QoS,
    pub reconnect_delay: Duration,
}

pub struct DetectionWorker {
    subscriber: DetectionSubscriber,
}

impl DetectionWorker {
    /// Wire the broker session, producer and analyzer together.
    ///
    /// Without a vision model the worker still connects and consumes, but
    /// every message fails with an analyzer-unavailable error.
    pub fn new(
        config: DetectionWorkerConfig,
        vision_model: Option<Arc<dyn VisionModel>>,
    ) -> anyhow::Result<Self> {
        info!("Initializing detection worker");

        let options = build_mqtt_options(&config.mqtt)?;
        let (client, eventloop) = AsyncClient::new(options, MQTT_REQUEST_CAPACITY);

        let producer = Arc::new(MqttDetectionProducer::new(
            Arc::new(MqttClientPublisher::new(client.clone())),
            config.output_topic,
            config.qos,
        ));

        let analyzer = match vision_model {
            Some(model) => MedicineAnalyzer::new(model),
            None => {
                warn!("no vision model configured, image analysis will fail");
                MedicineAnalyzer::unavailable()
            }
        };

        let service = Arc::new(DetectionService::new(analyzer, producer));

        let subscriber = DetectionSubscriber::new(
            client,
            eventloop,
            DetectionSubscriberConfig {
                input_topic: config.input_topic,
                qos: config.qos,
                reconnect_delay: config.reconnect_delay,
            },
            service,
        );

        info!("Detection worker initialized");

        Ok(Self { subscriber })
    }

    pub fn into_runner_process(self) -> AppProcess {
        let subscriber = self.subscriber;
        Box::new(move |ctx: CancellationToken| -> ProcessFuture {
            Box::pin(async move { subscriber.run(ctx).await })
        })
    }
}
