pub mod boot;
pub mod config;
pub mod error;

pub use boot::{BootState, StaticBootState};
pub use config::{Config, RuleClass, RuleSourceConfig};
pub use error::*;
