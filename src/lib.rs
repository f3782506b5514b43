//! Daily summary statistics for research studies: validation of query
//! string parameters, study-scoped querying, projection to JSON and the
//! HTTP endpoint serving it, plus provisioning of the hosting environment.

pub mod api;
pub mod config;
pub mod db;
pub mod fields;
pub mod form;
pub mod models;
pub mod provision;
pub mod query;
pub mod schema;
pub mod serialize;
pub mod store;
