//! dapsession - debug session engine for the Debug Adapter Protocol
//!
//! Drives one debug adapter at a time: transport and request correlation
//! live in [`dap`], session state, breakpoints, stack inspection and watches
//! in [`session`]. [`cli`] is a small interactive front end on top.

pub mod cli;
pub mod commands;
pub mod common;
pub mod dap;
pub mod session;

pub use common::{Error, Result};
