//! Long-running token refresh daemon.
//!
//! Loads an [`adtoken::AdTokenConfig`], keeps the background sweep running
//! and exposes a small admin API over the library's [`adtoken::TokenService`].

pub mod api;
