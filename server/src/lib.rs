//! Bitmap community platform server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod config;
pub mod error;
pub mod notify;
pub mod routes;
pub mod state;
pub mod ws;
