use std::sync::Arc;

use engram_engine::MemoryEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MemoryEngine>,
}

impl AppState {
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self { engine }
    }
}
