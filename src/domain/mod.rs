pub mod commands;
pub mod handshake;
pub mod models;
pub mod settings;
