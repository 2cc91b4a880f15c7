use crate::domain::{DetectionService, ImageMessage};
use common::domain::{DetectionError, ANALYSIS_OK};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

/// Upper bound on flushing the DISCONNECT packet during shutdown
const DISCONNECT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DetectionSubscriberConfig {
    pub input_topic: String,
    pub qos: QoS,
    /// Pause after a connection error before the event loop reconnects
    pub reconnect_delay: Duration,
}

/// Drives the MQTT event loop for the worker's single broker session.
///
/// The event loop is polled continuously and never waits on message
/// handling: image messages are queued to a single handler task that
/// processes them one at a time in arrival order. Its publishes go through
/// the client's request channel, which only drains while the loop is polled.
///
/// Subscribes to the input topic on every successful CONNACK (the session is
/// clean, so subscriptions do not survive reconnects).
pub struct DetectionSubscriber {
    client: AsyncClient,
    eventloop: EventLoop,
    config: DetectionSubscriberConfig,
    service: Arc<DetectionService>,
}

impl DetectionSubscriber {
    pub fn new(
        client: AsyncClient,
        eventloop: EventLoop,
        config: DetectionSubscriberConfig,
        service: Arc<DetectionService>,
    ) -> Self {
        Self {
            client,
            eventloop,
            config,
            service,
        }
    }

    #[instrument(name = "mqtt_subscriber", skip_all, fields(topic = %self.config.input_topic))]
    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        let Self {
            client,
            mut eventloop,
            config,
            service,
        } = self;

        info!("starting MQTT subscriber");

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let handler = tokio::spawn(process_messages(message_rx, service));

        let result = loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!("shutdown signal received");
                    break Ok(());
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let message = ImageMessage::new(publish.topic, publish.payload);
                            if message_tx.send(message).is_err() {
                                break Err(anyhow::anyhow!("MQTT message handler stopped"));
                            }
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("connected to MQTT broker");
                            request_subscription(&client, &config);
                        }
                        Ok(Event::Incoming(Packet::SubAck(suback))) => {
                            if subscription_rejected(&suback) {
                                error!(
                                    return_codes = ?suback.return_codes,
                                    "MQTT broker rejected subscription, no images will be received"
                                );
                            } else {
                                debug!(return_codes = ?suback.return_codes, "subscription acknowledged");
                            }
                        }
                        Ok(_) => {
                            // Pings, acks and outgoing notifications
                        }
                        Err(e) => {
                            match &e {
                                ConnectionError::ConnectionRefused(code) => error!(
                                    code = ?code,
                                    retry_in = ?config.reconnect_delay,
                                    "MQTT broker refused connection"
                                ),
                                _ => error!(
                                    error = %e,
                                    retry_in = ?config.reconnect_delay,
                                    "MQTT connection error"
                                ),
                            }

                            // The next poll reconnects
                            tokio::select! {
                                _ = ctx.cancelled() => break Ok(()),
                                _ = tokio::time::sleep(config.reconnect_delay) => {}
                            }
                        }
                    }
                }
            }
        };

        drop(message_tx);
        handler.abort();

        disconnect(&client, &mut eventloop).await;
        info!("MQTT subscriber stopped");
        result
    }
}

/// Queue the input subscription without blocking the event loop
fn request_subscription(client: &AsyncClient, config: &DetectionSubscriberConfig) {
    let client = client.clone();
    let topic = config.input_topic.clone();
    let qos = config.qos;

    tokio::spawn(
        async move {
            if let Err(e) = client.subscribe(topic, qos).await {
                error!(error = %e, "failed to request MQTT subscription");
            }
        }
        .in_current_span(),
    );
}

fn subscription_rejected(suback: &SubAck) -> bool {
    suback
        .return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
}

/// Handle queued messages one at a time until the queue is closed
async fn process_messages(
    mut messages: mpsc::UnboundedReceiver<ImageMessage>,
    service: Arc<DetectionService>,
) {
    while let Some(message) = messages.recv().await {
        handle_mqtt_message(message, &service).await;
    }
}

/// Queue a DISCONNECT and poll until it has been written
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    let drain = async {
        // The request channel may be full of publishes, so keep polling while queueing
        let request = client.disconnect();
        tokio::pin!(request);
        let mut requested = false;

        loop {
            tokio::select! {
                result = &mut request, if !requested => {
                    if result.is_err() {
                        return;
                    }
                    requested = true;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => return,
                    Ok(_) => {}
                },
            }
        }
    };

    if tokio::time::timeout(DISCONNECT_DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("timed out waiting for MQTT disconnect");
    }
}

/// Handle an incoming image message
///
/// Creates a new independent trace for each message (not nested under the subscriber trace).
/// Failures are logged and the message is dropped; the subscriber keeps running.
pub(crate) async fn handle_mqtt_message(message: ImageMessage, service: &DetectionService) {
    let span = info_span!(
        parent: Span::none(),
        "mqtt_message",
        topic = %message.topic,
        payload_size = message.payload.len(),
    );

    async {
        info!(queued_ms = message.elapsed_ms(), "received image message");

        match service.process_image_message(&message).await {
            Ok(detection) => {
                info!(
                    result_code = ANALYSIS_OK,
                    unrecognized = detection.info.is_unrecognized(),
                    latency_ms = message.elapsed_ms(),
                    "image analysis published"
                );
            }
            Err(e) => match &e {
                DetectionError::Decode(_) => {
                    warn!(
                        error = %e,
                        kind = e.kind(),
                        result_code = e.result_code(),
                        latency_ms = message.elapsed_ms(),
                        "invalid image payload, skipping message"
                    );
                }
                DetectionError::ResponseParse { raw_response, .. } => {
                    error!(
                        error = %e,
                        kind = e.kind(),
                        result_code = e.result_code(),
                        raw_response = %raw_response,
                        latency_ms = message.elapsed_ms(),
                        "analyzer returned unparseable response"
                    );
                }
                _ => {
                    error!(
                        error = %e,
                        kind = e.kind(),
                        result_code = e.result_code(),
                        latency_ms = message.elapsed_ms(),
                        "image analysis failed"
                    );
                }
            },
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection_worker::MQTT_REQUEST_CAPACITY;
    use crate::domain::test_support::base64_test_image;
    use crate::domain::{MedicineAnalyzer, MockVisionModel};
    use crate::mqtt::MqttDetectionProducer;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::{Bytes, BytesMut};
    use common::domain::MockDetectionProducer;
    use common::mqtt::{
        build_mqtt_options, MqttClientPublisher, MqttConnectionConfig, DEFAULT_MAX_PACKET_SIZE,
    };
    use image::{ImageFormat, Rgb, RgbImage};
    use mockall::Sequence;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish, Subscribe};
    use serde_json::Value;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    const INPUT_TOPIC: &str = "medscan/in";
    const OUTPUT_TOPIC: &str = "medscan/out";
    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    /// Minimal MQTT 3.1.1 broker speaking rumqttc's own packet codec
    struct TestBroker {
        listener: TcpListener,
    }

    impl TestBroker {
        async fn start() -> Self {
            Self {
                listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        fn port(&self) -> u16 {
            self.listener.local_addr().unwrap().port()
        }

        async fn accept(&self) -> BrokerSession {
            let (stream, _) = tokio::time::timeout(READ_TIMEOUT, self.listener.accept())
                .await
                .expect("worker did not connect")
                .unwrap();
            BrokerSession {
                stream,
                buffer: BytesMut::new(),
            }
        }
    }

    struct BrokerSession {
        stream: TcpStream,
        buffer: BytesMut,
    }

    impl BrokerSession {
        /// Next packet from the worker, answering keep-alive pings
        async fn read_packet(&mut self) -> Packet {
            loop {
                match rumqttc::mqttbytes::v4::read(&mut self.buffer, 16 * 1024 * 1024) {
                    Ok(Packet::PingReq) => {
                        self.stream.write_all(&[0xD0, 0x00]).await.unwrap();
                        continue;
                    }
                    Ok(packet) => return packet,
                    Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => {}
                    Err(e) => panic!("malformed packet from worker: {:?}", e),
                }

                let read = tokio::time::timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.buffer))
                    .await
                    .expect("timed out waiting for worker packet")
                    .unwrap();
                assert!(read > 0, "worker closed the connection");
            }
        }

        async fn write(&mut self, buffer: BytesMut) {
            self.stream.write_all(&buffer).await.unwrap();
        }

        async fn accept_connect(&mut self, code: ConnectReturnCode) {
            assert!(matches!(self.read_packet().await, Packet::Connect(_)));
            let mut buffer = BytesMut::new();
            ConnAck::new(code, false).write(&mut buffer).unwrap();
            self.write(buffer).await;
        }

        async fn expect_subscribe(&mut self) -> Subscribe {
            let subscribe = match self.read_packet().await {
                Packet::Subscribe(subscribe) => subscribe,
                other => panic!("expected SUBSCRIBE, got {:?}", other),
            };
            let mut buffer = BytesMut::new();
            SubAck::new(
                subscribe.pkid,
                vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
            )
            .write(&mut buffer)
            .unwrap();
            self.write(buffer).await;
            subscribe
        }

        async fn send_image(&mut self, payload: &str) {
            let mut buffer = BytesMut::new();
            Publish::new(INPUT_TOPIC, QoS::AtMostOnce, payload)
                .write(&mut buffer)
                .unwrap();
            self.write(buffer).await;
        }

        async fn expect_detection(&mut self) -> Value {
            match self.read_packet().await {
                Packet::Publish(publish) => {
                    assert_eq!(publish.topic, OUTPUT_TOPIC);
                    serde_json::from_slice(&publish.payload).unwrap()
                }
                other => panic!("expected PUBLISH, got {:?}", other),
            }
        }
    }

    fn numbered_model() -> MockVisionModel {
        let counter = AtomicUsize::new(0);
        let mut model = MockVisionModel::new();
        model.expect_generate().returning(move |_, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!(
                r#"{{"Nama_Obat":"Obat-{}","Fungsi_Obat":"demam","Cara_penggunaan":"3 kali sehari"}}"#,
                n
            ))
        });
        model
    }

    fn start_subscriber(
        port: u16,
        model: MockVisionModel,
        ctx: CancellationToken,
    ) -> JoinHandle<anyhow::Result<()>> {
        let options = build_mqtt_options(&MqttConnectionConfig {
            broker: "127.0.0.1".to_string(),
            port,
            client_id: "medscan-test".to_string(),
            username: "worker".to_string(),
            password: "secret".to_string(),
            keep_alive_secs: 30,
            tls_enabled: false,
            tls_insecure: false,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        })
        .unwrap();
        let (client, eventloop) = AsyncClient::new(options, MQTT_REQUEST_CAPACITY);

        let producer = Arc::new(MqttDetectionProducer::new(
            Arc::new(MqttClientPublisher::new(client.clone())),
            OUTPUT_TOPIC.to_string(),
            QoS::AtMostOnce,
        ));
        let service = Arc::new(DetectionService::new(
            MedicineAnalyzer::new(Arc::new(model)),
            producer,
        ));

        let subscriber = DetectionSubscriber::new(
            client,
            eventloop,
            DetectionSubscriberConfig {
                input_topic: INPUT_TOPIC.to_string(),
                qos: QoS::AtMostOnce,
                reconnect_delay: Duration::from_millis(50),
            },
            service,
        );

        tokio::spawn(subscriber.run(ctx))
    }

    /// Base64 PNG of random pixels, large enough not to compress away
    fn large_base64_png() -> String {
        let mut seed: u32 = 0x1234_5678;
        let image = RgbImage::from_fn(320, 240, |_, _| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let [r, g, b, _] = seed.to_be_bytes();
            Rgb([r, g, b])
        });

        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        STANDARD.encode(buffer.into_inner())
    }

    #[tokio::test]
    async fn test_run_handles_burst_in_order_and_disconnects() {
        let burst = MQTT_REQUEST_CAPACITY * 4;
        let broker = TestBroker::start().await;
        let token = CancellationToken::new();
        let worker = start_subscriber(broker.port(), numbered_model(), token.clone());

        let mut session = broker.accept().await;
        session.accept_connect(ConnectReturnCode::Success).await;
        let subscribe = session.expect_subscribe().await;
        assert_eq!(subscribe.filters[0].path, INPUT_TOPIC);

        let image = base64_test_image(ImageFormat::Png);
        for _ in 0..burst {
            session.send_image(&image).await;
        }

        for n in 0..burst {
            let detection = session.expect_detection().await;
            assert_eq!(detection["Nama_Obat"], format!("Obat-{}", n));
            assert!(detection["timestamp"].is_string());
        }

        token.cancel();
        assert!(matches!(session.read_packet().await, Packet::Disconnect));
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_accepts_payload_above_library_default_limit() {
        let image = large_base64_png();
        assert!(image.len() > 10 * 1024);

        let broker = TestBroker::start().await;
        let token = CancellationToken::new();
        let _worker = start_subscriber(broker.port(), numbered_model(), token.clone());

        let mut session = broker.accept().await;
        session.accept_connect(ConnectReturnCode::Success).await;
        session.expect_subscribe().await;

        session.send_image(&image).await;

        let detection = session.expect_detection().await;
        assert_eq!(detection["Nama_Obat"], "Obat-0");

        token.cancel();
    }

    #[tokio::test]
    async fn test_run_resubscribes_after_reconnect() {
        let broker = TestBroker::start().await;
        let token = CancellationToken::new();
        let _worker = start_subscriber(broker.port(), numbered_model(), token.clone());

        let mut first = broker.accept().await;
        first.accept_connect(ConnectReturnCode::Success).await;
        first.expect_subscribe().await;
        drop(first);

        let mut second = broker.accept().await;
        second.accept_connect(ConnectReturnCode::Success).await;
        let subscribe = second.expect_subscribe().await;
        assert_eq!(subscribe.filters[0].path, INPUT_TOPIC);

        second
            .send_image(&base64_test_image(ImageFormat::Png))
            .await;
        assert_eq!(second.expect_detection().await["Nama_Obat"], "Obat-0");

        token.cancel();
    }

    #[tokio::test]
    async fn test_run_retries_after_refused_connection() {
        let broker = TestBroker::start().await;
        let token = CancellationToken::new();
        let _worker = start_subscriber(broker.port(), numbered_model(), token.clone());

        let mut refused = broker.accept().await;
        refused
            .accept_connect(ConnectReturnCode::NotAuthorized)
            .await;

        let mut accepted = broker.accept().await;
        accepted.accept_connect(ConnectReturnCode::Success).await;
        accepted.expect_subscribe().await;
        drop(refused);

        token.cancel();
    }

    #[test]
    fn test_subscription_rejected_on_any_failure_code() {
        let granted = SubAck::new(1, vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]);
        let refused = SubAck::new(
            2,
            vec![
                SubscribeReasonCode::Success(QoS::AtMostOnce),
                SubscribeReasonCode::Failure,
            ],
        );

        assert!(!subscription_rejected(&granted));
        assert!(subscription_rejected(&refused));
    }

    fn create_service(model: MockVisionModel, producer: MockDetectionProducer) -> DetectionService {
        DetectionService::new(
            MedicineAnalyzer::new(Arc::new(model)),
            Arc::new(producer),
        )
    }

    fn image_message(payload: impl Into<Bytes>) -> ImageMessage {
        ImageMessage::new("obat/gambar", payload.into())
    }

    #[tokio::test]
    async fn test_handle_message_publishes_detection() {
        let mut model = MockVisionModel::new();
        model.expect_generate().times(1).returning(|_, _| {
            Ok(r#"{"Nama_Obat":"Paracetamol","Fungsi_Obat":"meredakan demam","Cara_penggunaan":"3-4 kali sehari"}"#.to_string())
        });

        let mut producer = MockDetectionProducer::new();
        producer
            .expect_publish()
            .withf(|detection| detection.info.name.as_deref() == Some("Paracetamol"))
            .times(1)
            .returning(|_| Ok(()));

        let service = create_service(model, producer);

        handle_mqtt_message(
            image_message(base64_test_image(ImageFormat::Jpeg)),
            &service,
        )
        .await;
    }

    #[tokio::test]
    async fn test_handle_message_survives_failures_in_order() {
        // garbage, then a good image, then a backend failure, then a good image
        let mut seq = Sequence::new();
        let mut model = MockVisionModel::new();
        model
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(r#"{"Nama_Obat":"A","Fungsi_Obat":"B","Cara_penggunaan":"C"}"#.to_string()));
        model
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(DetectionError::Backend("HTTP 503".to_string())));
        model
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(r#"{"Nama_Obat":"0","Fungsi_Obat":"0","Cara_penggunaan":"0"}"#.to_string()));

        let mut producer = MockDetectionProducer::new();
        producer.expect_publish().times(2).returning(|_| Ok(()));

        let service = create_service(model, producer);
        let image = Bytes::from(base64_test_image(ImageFormat::Png));

        handle_mqtt_message(image_message(Bytes::from_static(b"not an image")), &service).await;
        handle_mqtt_message(image_message(image.clone()), &service).await;
        handle_mqtt_message(image_message(image.clone()), &service).await;
        handle_mqtt_message(image_message(image), &service).await;
    }

    #[tokio::test]
    async fn test_handle_message_without_analyzer_publishes_nothing() {
        let mut producer = MockDetectionProducer::new();
        producer.expect_publish().times(0);

        let service = DetectionService::new(MedicineAnalyzer::unavailable(), Arc::new(producer));

        handle_mqtt_message(
            image_message(base64_test_image(ImageFormat::Png)),
            &service,
        )
        .await;
    }
}
