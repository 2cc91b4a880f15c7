mod medicine;
mod result;

pub use medicine::*;
pub use result::*;
