pub mod client;
pub mod demo;
pub mod protocol;
pub mod registry;
pub mod transport;
