pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod inference;
pub mod model;
pub mod service;
pub mod state;
