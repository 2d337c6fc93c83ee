//! Supporting resilience infrastructure: circuit breakers and the dead-letter queue.

pub mod circuit_breaker;
pub mod dlq;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakers};
pub use dlq::{DeadLetterQueue, DlqEntry, OutboundAdapter};
