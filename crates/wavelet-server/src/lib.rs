//! The process binary: wires the storage facade, outbox dispatcher,
//! broker consumer, participant cache, and authorization middleware into
//! one axum server, plus the ambient machinery (config, logging, metrics,
//! graceful shutdown) none of those crates own themselves.

mod breaker_registry;
mod http;
mod message_service;
mod noop_hub;
mod participant_source;
mod shutdown;

pub use breaker_registry::CircuitBreakerRegistry;
pub use http::{build_router, AppState};
pub use message_service::MessageService;
pub use noop_hub::LoggingHub;
pub use participant_source::FacadeParticipantSource;
pub use shutdown::Shutdown;
