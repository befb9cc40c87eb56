pub mod admin;
pub mod api;
pub mod catalog;
pub mod config;
pub mod models;
pub mod progress;
pub mod routes;
pub mod session;
pub mod views;
