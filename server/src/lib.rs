//! Beer API Server - CRUD REST API with real-time notifications.
//!
//! This crate provides the server for the Beer API, responsible for:
//! - Serving users, beers, breweries and beer comments over a JSON:API REST
//!   interface with bearer-token authentication
//! - Paginating collection listings with `Pagination-*` and `Link` headers
//! - Fanning out notifications about writes to every connected websocket
//!
//! # Architecture
//!
//! Write handlers depend only on the [`broadcast::Notifier`] capability. The
//! live implementation, [`broadcast::Broadcaster`], encodes each message once
//! and pushes it to every connection in the [`registry::ConnectionRegistry`].
//! Connections are accepted and torn down by
//! [`connection::ConnectionHandler`]. Delivery is best-effort and
//! at-most-once: nothing is queued for clients that are not connected.

pub mod auth;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod pagination;
pub mod registry;
pub mod routes;
pub mod store;
pub mod types;
