pub(crate) mod body;
pub(crate) mod codec;
mod server;

pub use body::BodyTooLarge;
pub(crate) use server::{CACHE_STATUS_HEADER, serve_connection};
