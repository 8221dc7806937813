// src/lib.rs

//! Updraft OTA Update Client
//!
//! Keeps a locally installed application package in step with the package a
//! server advertises, installing verified updates and rolling back any update
//! that never confirms it started successfully.
//!
//! # Architecture
//!
//! - Database-first: installed, previous and failed packages live in SQLite
//! - Verify before install: every payload is SHA-256 checked against the server hash
//! - Pending installs: an update stays pending until the application confirms it
//! - Automatic rollback: an unconfirmed update is reverted when its deadline elapses
//! - Blacklist: a package that was rolled back is never re-applied silently

pub mod acquisition;
pub mod config;
pub mod db;
mod error;
pub mod installer;
pub mod lifecycle;
pub mod packages;
pub mod platform;
pub mod store;
pub mod verify;

pub use error::{Error, Result};
