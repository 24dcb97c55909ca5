pub mod audit;
pub mod auth;
pub mod background;
pub mod config;
pub mod db;
pub mod documents;
pub mod error;
pub mod models;
pub mod negotiation;
pub mod routes;
pub mod rut;
pub mod schema;
pub mod state;
pub mod storage;
pub mod tasks;
pub mod tenancy;
pub mod uploads;
pub mod utils;

pub use background::{default_handlers, TaskRunner};
