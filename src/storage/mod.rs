//! Persistence: the keyed in-memory store, users, sessions and the Postgres pool.

pub mod error;
pub mod memory;
pub mod pool;
pub mod sessions;
pub mod users;

pub use error::DatabaseError;
pub use memory::{KeyedStore, MemoryStore};
pub use sessions::{MemorySessionStore, PgSessionStore, SessionData, SessionStore};
pub use users::{InMemoryUserRepository, PgUserRepository, PublicUser, User, UserRepository};
