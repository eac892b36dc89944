pub mod config;
pub mod db;
pub mod logging;
pub mod realtime;
pub mod repositories;
