pub mod constants;
pub mod layout;
pub mod lock;
pub mod options;

pub use layout::FilesystemLayout;
pub use lock::RuntimeLock;
pub use options::{InterfaceOptions, ProbeOptions, ProxyOptions, RelayOptions, TunnelOptions};
