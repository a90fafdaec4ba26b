//! relayhub: a multi-tenant relay gateway fronting upstream LLM
//! providers behind OpenAI, Claude, Gemini and Midjourney surfaces.
//!
//! Clients present an API key; the gateway authenticates it, resolves
//! the allowed model set, selects an upstream channel for the caller's
//! pricing group, forwards the request and meters consumption against
//! the key's quota, retrying transient upstream failures on another
//! channel.

pub mod config;
pub mod db;
pub mod error;
pub mod logger;
pub mod pricing;
pub mod relay;
pub mod server;
