pub mod org;
pub mod server;
