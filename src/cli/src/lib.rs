//! zeroimage CLI - command definitions and dispatch.

pub mod commands;
