// Keymirror daemon library
// Exposes internal modules for integration tests and embedding

#[macro_use]
extern crate log;

pub mod config;
pub mod core;
pub mod rpc;
