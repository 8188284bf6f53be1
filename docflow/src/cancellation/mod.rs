//! Graceful and immediate cancellation with resumable state.

mod manager;
mod state;
mod store;

pub use manager::{
    CancellationConfig, CancellationEvent, CancellationManager, CancellationStatus, CleanupHandler,
    CleanupTask,
};
pub use state::ProcessingState;
pub use store::{STATE_VERSION, SavedStateInfo, StateFileMetadata, StateStore};
