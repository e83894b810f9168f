#[macro_use]
extern crate log;

pub mod audit;
pub mod auth;
pub mod authority;
pub mod backend;
pub mod config;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod locks;
pub mod services;
pub mod types;
pub mod utils;
