pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod db_migrate;
pub mod error;
pub mod ids;
pub mod models;
pub mod password;
pub mod resolver;
pub mod server;
pub mod service;
pub mod session;
pub mod state;
pub mod store;
// re-export items if you prefer a flat structure:
pub use error::Result as AppResult;
pub use resolver::PermissionResolver;
pub use service::AccessService;
pub use session::SessionStore;
pub use store::{IdentityStore, MemoryStore, ScyllaStore};
