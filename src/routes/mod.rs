#[allow(clippy::module_inception)]
pub mod routes;

pub use routes::{MULTIPART_PATH, REST_PATH, TUS_PATH, mount, routes};
