// src/lib.rs
pub mod banner;
pub mod case;
pub mod config;
pub mod errors;
pub mod models;
pub mod results;
pub mod runner;
pub mod server;
