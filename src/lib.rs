pub mod config;
pub mod error;
pub mod gatherer;
pub mod image_reference;
pub mod registry;
pub mod scanner;
pub mod secret_string;
pub mod version;

pub use config::Config;
pub use gatherer::{DataGatherer, ResultRecord};
