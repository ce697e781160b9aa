//! Inventory/sales entity catalog.
//!
//! Declares the entity types of the inventory application (what they
//! reference, how duplicates are recognized, which children the server
//! creates alongside them). The synchronization engine is generic; this crate
//! is what makes it an inventory client.

pub mod catalog;

pub use catalog::{
    BACK_ORDERS, CATEGORIES, PRODUCTS, SALES_RETURN_ITEMS, SALES_RETURNS, STOCK_INS, STOCK_OUTS,
    descriptors, registry,
};
