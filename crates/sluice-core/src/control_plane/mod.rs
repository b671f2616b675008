//! Control-plane protocol: session configuration, channel lifecycle, status
//! and blob registration.

pub mod client;
pub mod protocol;
pub mod rest;
pub mod transport;

pub use client::{ChannelRef, ControlPlaneClient, RequestIdGenerator};
pub use rest::{
    token_provider_from_config, EnvTokenProvider, RestTransport, StaticTokenProvider,
    TokenProvider,
};
pub use transport::ControlPlaneTransport;
