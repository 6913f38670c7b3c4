#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod catalog;
pub mod chan;
pub mod comment;
pub mod config;
pub mod data;
pub mod geo;
pub mod media;
pub mod settings;
pub mod storage;
pub mod ui;
pub mod watch;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
