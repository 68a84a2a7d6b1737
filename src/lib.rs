// Rolegate - library root

pub mod assume;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod http_client;
pub mod output;
pub mod profile;
pub mod prompt;
pub mod resolver;
pub mod sso;
