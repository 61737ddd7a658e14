/// Catalog and cart entities
pub mod cart;
pub mod cart_item;
pub mod product_variant;
pub mod promotion;

// Re-export entities
pub use super::product::{Entity as Product, Model as ProductModel};
pub use cart::{Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use product_variant::{Entity as ProductVariant, Model as ProductVariantModel};
pub use promotion::{DiscountType, Entity as Promotion, Model as PromotionModel};
