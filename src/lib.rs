// src/lib.rs
pub mod capture;
pub mod config;
pub mod error;
pub mod keys;
pub mod probe;
pub mod proxy;
pub mod registration;
pub mod runner;
pub mod sequencer;
pub mod transport;

#[cfg(test)]
mod test_helpers;
