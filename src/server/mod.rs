//! HTTP rendering of the catalog, indexer and release operations under
//! `/api/v1`, with every response in the `{data, error}` envelope.

mod applications;
mod attachments;
mod categories;
pub mod dto;
pub mod extract;
mod repositories;
pub mod response;
mod reviews;
mod router;
mod templates;
mod versions;

pub use router::{AppState, create_router};
