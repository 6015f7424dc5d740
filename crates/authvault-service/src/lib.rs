pub mod app;
pub mod client;
pub mod server;

pub use app::{build, App};
pub use client::BundleClient;
pub use server::BundleServer;
