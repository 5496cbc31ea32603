//! Helpdesk domain: tickets, their audit trail, customers and the
//! acknowledgement template sent for new tickets.

pub mod audit;
pub mod clients;
pub mod priority;
pub mod reply;
pub mod tickets;
pub mod types;

pub use audit::{AuditContext, AuditService};
pub use clients::{
    Association, ClientAssociation, ClientSyncReport, CustomerMatch, MatchSource,
};
pub use priority::classify_priority;
pub use tickets::{TicketService, TicketUpdate};
pub use types::*;

#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("ticket {0} not found")]
    TicketNotFound(i64),

    #[error("customer {0} not found")]
    CustomerNotFound(i64),

    #[error("department {0} not found")]
    DepartmentNotFound(i64),

    #[error("ticket {0} is closed")]
    Closed(i64),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
