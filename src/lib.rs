pub mod config;
pub mod error;
pub mod host;
pub mod nvmap;
pub mod range;
pub mod uapi;
pub mod utils;

pub use config::HostConfig;
pub use error::{HostError, HostResult};
pub use host::{ChannelContext, ChannelFiles, Host, HostBuilder};
