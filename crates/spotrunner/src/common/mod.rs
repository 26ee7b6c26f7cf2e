pub mod cli;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod memo;
pub mod parser;
pub mod setup;
pub mod timeutils;

