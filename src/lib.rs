#![forbid(unsafe_code)]

//! Shared library for the grabtube backend.

pub mod catalog;
pub mod config;
pub mod extractor;
pub mod security;
pub mod tracker;
