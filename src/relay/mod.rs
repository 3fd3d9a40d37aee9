//! # Relay Core
//!
//! Server-side pipeline between a client connection and the generation API.
//!
//! ## Key Components:
//! - **chunker**: fixed-size upload windows over one utterance payload
//! - **retry**: fixed-delay retry on rate-limit replies
//! - **generation**: the `generateContent` client and its error taxonomy
//! - **session**: per-connection loop that ties the three together
//! - **messages**: frames exchanged with clients
//!
//! The WebSocket actor that owns a session lives in `src/websocket.rs`.

pub mod chunker;
pub mod generation;
pub mod messages;
pub mod retry;
pub mod session;
