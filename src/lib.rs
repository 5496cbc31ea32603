//! Email-to-ticket synchronization for multi-department helpdesks.

pub mod api;
pub mod config;
pub mod constants;
pub mod helpdesk;
pub mod mail;
pub mod retry;
pub mod store;
pub mod sync;
