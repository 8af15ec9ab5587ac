//! Order aggregate and related types.

mod aggregate;
mod value_objects;

pub use aggregate::{Order, OrderLine};
pub use value_objects::Money;

use thiserror::Error;

/// Errors raised by order invariants.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Customer is required.
    #[error("Customer is required")]
    EmptyCustomer,

    /// Invalid quantity.
    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    /// Invalid price.
    #[error("Invalid price: {price} cents (must not be negative)")]
    InvalidPrice { price: i64 },
}
