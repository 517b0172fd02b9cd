mod admin;

pub use admin::{backup, create_auth_code, create_token, delete_token, list_tokens};
