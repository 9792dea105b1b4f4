pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod files;
pub mod media;
pub mod models;
pub mod pagination;
pub mod policy;
pub mod routes;
pub mod schema;
pub mod state;
pub mod storage;
pub mod utils;
