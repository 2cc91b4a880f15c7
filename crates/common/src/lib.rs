pub mod domain;
pub mod mqtt;
pub mod telemetry;

pub use domain::*;
pub use mqtt::*;
pub use telemetry::*;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockDetectionProducer;
#[cfg(any(test, feature = "testing"))]
pub use mqtt::MockMqttPublisher;
