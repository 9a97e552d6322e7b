#![forbid(unsafe_code)]

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod constants;
pub mod dist_backend;
pub mod error;
pub mod forms;
pub mod models;
pub mod observability;
pub mod runtime;
pub mod storage;
pub mod upload;
