pub mod broker;
pub mod config;
pub mod coordination;
pub mod db;
pub mod logging;
pub mod provider_client;
pub mod repositories;
