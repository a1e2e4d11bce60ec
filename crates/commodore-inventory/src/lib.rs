//! Reclass-compatible hierarchy store and renderer.
//!
//! A cluster's configuration is a set of *classes*: YAML documents with an
//! ordered `classes` include list and a deep-mergeable `parameters` tree.
//! This crate stores classes on disk, expands includes depth-first with
//! first-occurrence dedup, merges parameters in include order, resolves
//! `${a:b:c}` references, and renders the `applications` list with its
//! `~`-removal operator.
//!
//! The merge and reference semantics follow reclass:
//!
//! - maps deep-merge, scalars and lists replace;
//! - a key suffixed with `+` appends to a base list (or deep-merges maps);
//! - a key prefixed with `=` is constant and rejects later assignment;
//! - `${...}` references resolve against the final parameter tree, may
//!   nest, and error on cycles; `?{...}` secret tokens pass through
//!   untouched.

mod error;
mod interpolate;
mod render;
mod store;
mod value;

pub use error::RenderError;
pub use interpolate::interpolate;
pub use render::{Rendered, render_array, render_classes, render_classes_with};
pub use store::{Class, ClassStore};
pub use value::{Value, merge};
