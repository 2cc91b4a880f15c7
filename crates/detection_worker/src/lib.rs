pub mod detection_worker;
pub mod domain;
pub mod gemini;
pub mod mqtt;

pub use detection_worker::*;
pub use domain::*;
pub use gemini::*;
pub use mqtt::*;
