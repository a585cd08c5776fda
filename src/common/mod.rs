pub mod config;
pub(crate) mod dropout;
pub mod error;

pub use config::Config;
pub use error::GlinerError;
