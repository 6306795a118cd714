pub mod account;
pub mod config;

pub use account::PoolAccount;
pub use config::GatewayConfig;
