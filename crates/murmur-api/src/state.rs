use std::sync::Arc;

use murmur_core::ChatServices;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub services: ChatServices,
    pub jwt_secret: String,
}
