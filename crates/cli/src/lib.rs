//! Support code for the `sp420` command line tool

pub mod config;
pub mod session;

pub use config::Config;
