use askops_core::session::SessionStoreError;

pub mod memory;
pub mod session;

pub use memory::InMemorySessionStore;
pub use session::SqlSessionStore;

pub(crate) fn backend_error(error: sqlx::Error) -> SessionStoreError {
    SessionStoreError::Backend(error.to_string())
}

pub(crate) fn decode_error(error: impl std::fmt::Display) -> SessionStoreError {
    SessionStoreError::Decode(error.to_string())
}
