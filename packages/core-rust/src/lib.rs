//! `Tether` Core: transactions, the context store, and method interception.

pub mod shim;
pub mod store;
pub mod transaction;

pub use shim::{unwrap_method, wrap_method, MethodTable, NotWrappableReason, ShimError, Shimmer};
pub use store::{ContextGuard, ContextStore};
pub use transaction::{Transaction, TransactionHandle, TransactionId, TransactionState};
