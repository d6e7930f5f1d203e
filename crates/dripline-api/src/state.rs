//! Shared application state

use dripline_core::Engine;
use std::sync::Arc;

pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}
