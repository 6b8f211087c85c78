pub mod auth;
pub mod config;
pub mod ls;
pub mod upload;
pub mod utils;
