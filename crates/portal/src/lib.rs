//! Automatic key provisioning against the Clash of Clans developer portal.
//!
//! The portal only issues keys bound to a caller IP. [`PortalSource`] logs
//! into each configured account, learns the public IP from the session
//! token, revokes the proxy's keys that were issued for another IP and
//! creates new ones until each account holds its quota.

pub mod client;
pub mod jwt;
pub mod source;

pub use client::{CreateOutcome, PORTAL_BASE, PortalClient, PortalKey};
pub use source::PortalSource;
