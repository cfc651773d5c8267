//! Wyrm core library: the reverse-tunnel gateway, the device directory, and the device and
//! control-plane clients used by the CLI.

pub mod client;
pub mod config;
pub mod control;
pub mod directory;
pub mod gateway;
pub mod init;
