mod detection_service;
mod image_decoder;
mod medicine_analyzer;
mod vision_model;

pub use detection_service::*;
pub use image_decoder::*;
pub use medicine_analyzer::*;
pub use vision_model::*;

#[cfg(test)]
pub(crate) use image_decoder::test_support;
