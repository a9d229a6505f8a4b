//! Domain types: orders, alerts, feed keys and shared enums.

pub mod alert;
pub mod enums;
pub mod market;
pub mod order;

pub use alert::*;
pub use enums::*;
pub use market::*;
pub use order::*;
