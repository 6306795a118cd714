pub mod config;
pub mod credentials;
pub mod device_flow;
pub mod kiro_auth;
pub mod types;

pub use kiro_auth::KiroAuthManager;
