pub mod local_watcher;
pub mod reconciler;
pub mod remote_watcher;
pub mod store;
pub mod transfer;
