pub mod config;
pub mod context;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod runner;
pub mod sm;
pub mod store;

pub use config::ServedConfig;
pub use context::Collaborators;
pub use error::{Result, ServedError};
pub use runner::Runner;
pub use store::Store;
