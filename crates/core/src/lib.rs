pub mod error;
pub mod moe;
pub mod quantization;
pub mod tolerance;

pub use error::{MoeError, Result};
