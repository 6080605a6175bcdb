pub mod cli;
pub mod config;
pub mod download;
mod error;
pub mod local;
pub mod lookup;
pub mod neighbours;
pub mod router;
pub mod servent;
pub mod transport;
pub mod wire;

pub use cli::Cli;
pub use config::Config;
pub use error::ServentError;
pub use servent::Servent;

pub type Result<T> = std::result::Result<T, ServentError>;
