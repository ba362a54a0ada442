#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod config;
pub mod data;
pub mod engine;
pub mod follow_graph;
pub mod item;
pub mod oauth;
pub mod pagination;
pub mod refresh;
pub mod resolve;
pub mod session;
pub mod singleflight;
pub mod sink;
pub mod task;
pub mod tumblr;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, RunOptions};
