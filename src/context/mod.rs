//! Service worker context: the coordination actor and its handle

mod actor;
mod commands;
mod handle;

pub use handle::{ContextBuilder, ServiceWorkerContext};
