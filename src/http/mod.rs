//! HTTP surface: router, blob retrieval, range handling, upload/delete, and
//! the statistics page.

pub mod blob;
pub mod handler;
pub mod range;
pub mod stats;
pub mod upload;
