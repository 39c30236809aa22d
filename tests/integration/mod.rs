//! Integration Tests Module
//!
//! End-to-end tests of the chat engine against a recording transport and real
//! history stores. No network is involved; backend frames are fed directly.

// Request/response correlation, streaming and metrics
mod correlation_test;

// Cross-agent routing and session persistence
mod routing_test;
