pub mod admin_auth;
pub mod health_handlers;
pub mod installation_handlers;
pub mod webhook_handlers;
