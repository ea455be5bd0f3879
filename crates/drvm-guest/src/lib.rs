//! Guest half of the driver control plane: talks to the guest OS through a
//! [`DriverBackend`] and answers the host's RPC calls.

mod backend;
mod manager;
mod service;

pub use backend::{default_backend, CatalogBackend, DriverBackend, PnpUtilBackend};
pub use manager::{GuestDriverManager, GuestOptions};
pub use service::{bind, register_handlers, SharedManager};
