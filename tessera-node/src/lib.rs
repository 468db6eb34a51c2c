//! # tessera-node: compositing node
//!
//! Long-running process hosting one end of the tessera pipeline.
//!
//! ## Roles
//!
//! - **Source**: Renders frames with a synthetic renderer, reads them
//!   back and streams the images to every configured sink.
//! - **Sink**: Accepts sources over TCP and composites one output frame
//!   whenever all of its inputs are ready.

pub mod config;
pub mod service;
pub mod synthetic;
