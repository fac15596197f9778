pub mod config;
pub mod conn;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod listener;
pub mod namespace;
pub mod protocol;
pub mod shadow;
pub mod store;
pub mod translate;
pub mod types;
