// Checkout workflows
pub mod orders;
pub mod payments;
pub mod promotions;
pub mod refunds;

// Supporting facades
pub mod carts;
pub mod compliance;
