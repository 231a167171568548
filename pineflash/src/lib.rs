mod config;
mod connection;
mod error;
mod flasher;
pub mod protocol;
pub mod transport;

pub use config::Config;
pub use connection::Connection;
pub use error::{
    CmdError, Error, ErrorCategory, FlashError, ImageError, InterfaceError, MiscError, RomError,
};
pub use flasher::{BootRom, DeviceInfo, Flasher};
pub use transport::{SerialTransport, Transport};
