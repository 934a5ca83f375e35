pub mod components;
pub mod config;
pub mod error;
pub mod server;


pub use config::SuggestServiceConfig;
pub use error::SuggestServiceError;
pub use server::{create_router, run_server, AppState, SuggestionBackend};
