//! branchchat: a multi-provider AI chat server with branching conversations,
//! file attachments and read-only share links.

pub mod auth;
pub mod config;
pub mod db;
pub mod doc_processor;
pub mod error;
pub mod handlers;
pub mod llm;
pub mod storage;

pub use config::Config;
pub use handlers::{router, AppState};
