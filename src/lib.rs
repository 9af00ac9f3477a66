pub mod conf;
pub mod controller;
pub mod error;
pub mod events;
pub mod liveness;
pub mod procscan;
pub mod reconciler;
pub mod record;
pub mod server;
pub mod store;
pub mod utils;

#[cfg(test)]
mod test_support;
