//! Gateway: routing, sessions, proxying, and the HTTP server.

pub mod handlers;
pub mod proxy;
pub mod routes;
pub mod server;
pub mod session;

pub use handlers::{AppState, create_redirect_router, create_router};
pub use routes::{ResolvedRoute, RouteTable, RouteTarget, ServiceRoute};
pub use server::Gateway;
pub use session::{Session, SessionStore};
