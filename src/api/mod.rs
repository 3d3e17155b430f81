pub mod backend;
pub mod client;
pub mod resource;

pub use backend::Backend;
pub use client::{ApiClient, TokenSource, AUTH_TOKEN_KEY};
pub use resource::Resource;
