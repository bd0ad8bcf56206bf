//! Authenticated REST client for the record store. Exposes the record,
//! file, and binary operations the generation pipeline and worker consume.
//! The client acquires and refreshes its own bearer token, classifies
//! failures as retryable or terminal, and attaches the caller's correlation
//! id to every outbound request. It never retries on its own: retry
//! policy belongs to call sites, which differ between the interactive and
//! worker paths.

mod auth;
mod client;
mod error;
mod soql;

pub use auth::{AuthConfig, TokenGrant};
pub use client::{Client, ContentVersionIds, Session};
pub use error::Error;
pub use soql::{bind, quote_literal};
