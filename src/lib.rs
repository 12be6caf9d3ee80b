//! Seperate library crate so we can run benchmarks and integration tests

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod args;
pub mod capture;
pub mod chunk;
pub mod common;
pub mod comms;
pub mod config;
pub mod datagram;
pub mod merge;
pub mod metadata;
pub mod monitoring;
pub mod pipeline;
pub mod ring;
pub mod scan;
pub mod tasks;
