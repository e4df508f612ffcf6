pub mod backend;
pub mod feed;

pub use backend::RestBackend;
