//! Reusable `clap` argument blocks shared by the proxy's commands.
pub mod logging;
pub mod socket_addr;
pub mod tokio;
