pub mod aggregator;
pub mod bridge;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod filters;
pub mod gateway;
pub mod models;
pub mod scheduler;
pub mod state;
