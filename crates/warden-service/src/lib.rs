pub mod adapter;
pub mod cli;
pub mod config;
pub mod demo;
pub mod error;
pub mod logging;
pub mod service;
