//! CLI command implementations.

mod info;
mod serve;
mod trust;

pub use info::show_info;
pub use serve::{join, serve};
pub use trust::{list_trusted, remove_trusted};
