//! # Pay-Ins
//!
//! A pay-in is the durable record of one requested paid action and how
//! its cost is covered. The [`orchestrator`] owns the front half of the
//! lifecycle — costing, debiting, deciding optimistic vs. pessimistic
//! execution, issuing the invoice for any shortfall — and the
//! [`reconcile`] functions own the back half, driving pending pay-ins to
//! `PAID` or `FAILED` from observed network facts.

pub mod model;
pub mod orchestrator;
pub mod reconcile;

pub use model::{Invoice, PayIn, PayInFailureReason, PayInState, PayOut};
pub use orchestrator::{request_pay_in, PayInReceipt, PayInRequest};
