// Library exports for the mailrelay crate
// This allows tests and the binary to use the modules

pub mod config;
pub mod database;
pub mod email;
pub mod settings;
pub mod telegram;

// Mail side: IMAP session and the watcher task driving it
pub mod imap_client;
pub mod mail_watcher;

// Bot side: retention, operator commands and the supervisor
pub mod bot;
pub mod commands;
pub mod sweeper;
