pub mod error;
pub mod events;
pub mod routes;
pub mod server;
pub mod state;
pub mod ws;

pub use error::ApiError;
pub use server::run_server;
pub use state::ServerState;
