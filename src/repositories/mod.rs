//! Data access for the storefront workflow.
//!
//! Every function is generic over [`sea_orm::ConnectionTrait`] so the same
//! call runs against the pool or inside a transaction opened by a service.

pub mod cart_repository;
pub mod catalog_repository;
pub mod order_repository;
pub mod payment_repository;
pub mod refund_repository;

pub use cart_repository::CartRepository;
pub use catalog_repository::CatalogRepository;
pub use order_repository::OrderRepository;
pub use payment_repository::PaymentRepository;
pub use refund_repository::RefundRepository;
