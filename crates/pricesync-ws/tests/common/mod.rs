//! Shared fixtures for connection integration tests.

pub mod mock_ws;
