pub mod app;
pub mod artifact;
pub mod closure;
pub mod config;
pub mod data_types;
pub mod database;
pub mod domain;
pub mod entity;
pub mod error;
pub mod fs_util;
pub mod ingest;
pub mod output;
pub mod parameters;
pub mod signature;
pub mod spreadsheet;
pub mod store;
pub mod units;
pub mod validator;
pub mod value;
