pub mod accounts;
pub mod completions;
pub mod config;
pub mod handle_return;
pub mod login;
pub mod logout;
pub mod status;
pub mod token;
