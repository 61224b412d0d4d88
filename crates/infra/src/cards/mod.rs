//! Decision card persistence and lifecycle service.

pub mod postgres;
pub mod service;
pub mod store;

pub use postgres::PostgresCardStore;
pub use service::{CardService, CardServiceError, NewCard};
pub use store::{CardStore, CardStoreError, InMemoryCardStore};
