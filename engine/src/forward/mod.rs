//! # Invoice Forwards
//!
//! The relay half of the engine: [`wrap`] validates an inner payment
//! request and issues the inbound hold invoice covering it, and
//! [`machine`] walks the resulting [`model::InvoiceForward`] through its
//! lifecycle — held, forwarded, claimed — without ever paying out before
//! the inbound funds are committed.

pub mod machine;
pub mod model;
pub mod wrap;

pub use model::{ForwardStatus, InvoiceForward, Withdrawal, WithdrawalStatus};
pub use wrap::{wrap_invoice, WrapError, WrapRequest, WrappedInvoice};
