mod detection_producer;
mod subscriber;

pub use detection_producer::*;
pub use subscriber::*;
