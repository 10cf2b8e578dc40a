pub mod cli;
pub mod config;
pub mod db;
pub mod distribution;
pub mod error;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod registry;
pub mod retention;
pub mod routes;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod upstream;
