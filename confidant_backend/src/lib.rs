pub mod audio;
pub mod config;
pub mod context;
pub mod conversation;
pub mod database;
pub mod error;
pub mod http_client;
pub mod llm_client;
pub mod notifications;
pub mod proactive;
pub mod profile;
pub mod runtime;
pub mod speech;
pub mod store;
