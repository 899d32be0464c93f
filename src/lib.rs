pub mod app_context;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod core;
pub mod observability;
pub mod workflow;
