//! Route modules.

pub mod health;
pub mod payments;
pub mod refunds;
