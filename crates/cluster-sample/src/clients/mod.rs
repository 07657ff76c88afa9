//! Typed front doors to the sample's actors. Callers never build messages or reply references
//! themselves.

pub mod greeter_client;

pub use greeter_client::GreeterClient;
