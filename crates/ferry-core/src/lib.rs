pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod ports;
pub mod render;
pub mod types;

pub use config::{Credential, FerryConfig, PromotionChain};
pub use error::{FerryError, FerryResult};
pub use types::*;
