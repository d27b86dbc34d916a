pub mod admin;
pub mod request_id;

pub use admin::{require_admin_token, ADMIN_TOKEN_HEADER};
pub use request_id::{request_id_middleware, REQUEST_ID_HEADER};
