pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod extract;
pub mod migrate;
pub mod mongo_ext;
pub mod util;
