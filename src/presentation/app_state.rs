// Application state for HTTP handlers
use crate::application::synchronizer::SynchronizerHandle;

#[derive(Clone)]
pub struct AppState {
    pub sync: SynchronizerHandle,
}
