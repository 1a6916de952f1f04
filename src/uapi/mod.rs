pub mod ioctl;
pub mod request;
pub mod user;

pub use request::{Abi, ChannelRequest};
pub use user::{UserFault, UserMemory, UserSpace};
