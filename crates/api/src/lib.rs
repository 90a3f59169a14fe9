//! HTTP API: operator surface for the outbox relay.

pub mod app;
