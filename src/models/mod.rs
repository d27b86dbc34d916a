pub mod order;
pub mod product;
pub mod stock;

pub use order::{
    Address, CreateOrderRequest, Order, OrderItemRequest, OrderLine, OrderStatus, OrderTotals,
    PaymentMethod, PaymentStatus,
};
pub use product::{Category, Product, ProductPatch, Variant};
pub use stock::{StockKey, StockLevel, StockLine, StockShortage};
