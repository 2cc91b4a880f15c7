mod gemini_vision_model;

pub use gemini_vision_model::*;
