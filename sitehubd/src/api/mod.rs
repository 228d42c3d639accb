pub mod admin;
pub mod agent;
pub mod auth;
pub mod json;
pub mod routes;
pub mod tls;
