pub mod config;
pub mod error;
pub mod gate;
pub mod health;
pub mod proxy;
