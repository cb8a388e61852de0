pub mod catalog;
pub mod chat;
pub mod citations;
pub mod indexer;
