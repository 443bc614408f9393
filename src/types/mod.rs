mod models;
mod query;
mod role;
mod status;

pub use models::*;
pub use query::*;
pub use role::*;
pub use status::*;
