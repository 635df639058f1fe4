//! `volitas` binary support: CLI, HTTP surface and handler wiring.

pub mod app;
pub mod cli;
pub mod commands;
pub mod handlers;
