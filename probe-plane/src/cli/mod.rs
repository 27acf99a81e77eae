//! Command-line interface of the headless driver

pub mod args;

pub use args::Args;
