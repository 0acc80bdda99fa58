pub mod cookie;
pub mod pages;
pub mod routes;
pub mod server;
pub mod validation;

pub use server::{AppState, app, serve};
