//! Generation client for the relay.
//!
//! Keep the public surface small: a [`Provider`] does one stateless call, a
//! [`ConfigResolver`] picks persona and model per user, and
//! [`GenerationClient`] wires hooks, cache and retry around them.
//! Implementation details are split into submodules under `src/client/`.

pub mod generation;
pub mod provider;
pub mod resolver;

pub use generation::{build_messages, GenerationClient};
pub use provider::{HttpProvider, ModelParams, Provider};
pub use resolver::{
    ConfigResolver, ContextType, ModelProfile, Persona, PersonaResolver, ResolvedConfig,
    ResolverStats, StaticResolver, UserPreference,
};
