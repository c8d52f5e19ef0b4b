//! Weekly email digests of followed accounts' timelines.
//!
//! A digest moves through three batch stages, each run as its own command:
//! watermark initialization, cycle preparation and dispatch. A fourth command
//! mails confirmation links to new notification addresses. See
//! [`pipeline::Pipeline`].

pub mod config;
pub mod confirm;
pub mod db;
pub mod error;
pub mod lock;
pub mod mail;
pub mod model;
pub mod pipeline;
pub mod render;
pub mod timeline;
