#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod library;
pub mod logging;
pub mod media;
pub mod model;
pub mod ordering;
pub mod paginator;
pub mod reddit;
pub mod selection;
pub mod server;
pub mod session;
pub mod storage;
pub mod trigger;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
