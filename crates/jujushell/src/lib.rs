//! The Juju shell server.
//!
//! A WebSocket gateway giving authenticated Juju users an interactive
//! terminal inside a per-user LXD container, with the `juju` CLI already
//! logged into the controller.

pub mod api;
pub mod config;
pub mod ensure;
pub mod gc;
pub mod inject;
pub mod juju;
pub mod lxd;
pub mod metrics;
pub mod poll;
pub mod proxy;
pub mod registry;
pub mod singleflight;
pub mod store;
