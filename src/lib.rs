//! Homepane - a single-pane dashboard for self-hosted apps
//!
//! This library provides:
//! - A proxy configuration document generated from the server settings, in plain HTTP,
//!   manual TLS, or automatic HTTPS (ACME) mode
//! - An embedded reverse-proxy engine that serves that document in front of the dashboard
//! - A lifecycle manager that starts, reloads, and stops the engine
//! - A WebSocket event hub that pushes configuration and health changes to browsers
//! - Periodic health probes of every configured app

pub mod acme;
pub mod admin;
pub mod config;
pub mod dashboard;
pub mod document;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod healthcheck;
pub mod hub;
pub mod lifecycle;
pub mod pool;
pub mod proxy;
pub mod routes;
pub mod tls;
pub mod ws;
