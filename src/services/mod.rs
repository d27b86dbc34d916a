// Order fulfillment pipeline
pub mod inventory;
pub mod order_expiry;
pub mod orders;
pub mod payments;
pub mod pricing;

// External collaborators
pub mod catalog;
pub mod payment_gateway;
