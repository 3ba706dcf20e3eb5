//! replyflow web server.
//!
//! This crate provides the HTTP surface of replyflow: platform webhooks,
//! the operator API for publishing and controlling flows, the Postgres
//! flow and stats stores, and the HTTP messaging gateway client.

pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod routes;
