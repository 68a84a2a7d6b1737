// SSO OIDC device authorization and portal access

pub mod client;
pub mod flow;
pub mod manager;
pub mod portal;
pub mod types;

pub use client::{HttpOidcClient, OidcClient};
pub use flow::{DeviceFlow, FlowPolicy};
pub use manager::SsoTokenManager;
pub use portal::{HttpSsoPortal, SsoPortal};
pub use types::{ClientRegistration, DeviceAuthorization, DeviceFlowState, SsoToken};
