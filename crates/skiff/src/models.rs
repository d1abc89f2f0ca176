//! These models represent the objects passed around by the agent
//!
//! There are two related formats we need to interact with:
//! - the internal conversation history kept by the agent
//! - anthropic-style messages/tools, sent from the agent to the LLM
//!
//! We always immediately convert wire data into the internal structs using the helpers
//! in `providers::utils`, so the rest of the crate never touches raw JSON payloads.
pub mod message;
pub mod tool;
