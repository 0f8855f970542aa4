//! Domain layer: entity records and the table mapping they share.

pub mod entities;
pub mod schema;
pub mod types;
pub mod values;
