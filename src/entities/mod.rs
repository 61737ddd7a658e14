pub mod commerce;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod product;
pub mod refund;

pub use order::OrderStatus;
pub use payment::PaymentStatus;
pub use refund::RefundStatus;
