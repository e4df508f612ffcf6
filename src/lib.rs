pub mod api;
pub mod config;
pub mod engine;
pub mod entities;
pub mod error;
pub mod external;
pub mod server;
pub mod session;
pub mod simulation;

#[cfg(test)]
mod testing;
