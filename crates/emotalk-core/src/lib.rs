//! Core types, wire protocol, config, errors, personas, and conversation log for emotalk.

pub mod case;
pub mod config;
pub mod conversation_store;
pub mod error;
pub mod persona;
pub mod protocol;
pub mod types;
