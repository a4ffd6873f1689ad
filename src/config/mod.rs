//! Configuration: serde schema plus a JSON file loader

mod schema;
mod store;

pub use schema::*;
pub use store::load;
