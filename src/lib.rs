pub mod api;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod dns;
pub mod document;
pub mod hooks;
pub mod network_stack;
pub mod restart;
pub mod services;
pub mod sync_server;

pub use device::DeviceLink;
