/// Collector module
///
/// Everything between "which collectors exist" and "their documents
/// reached the server":
///
/// - registry:  collector descriptors, merge and execution order
/// - discovery: shell collectors found on disk
/// - executor:  sandboxed subprocess runs
/// - builtin:   compiled-in collectors
/// - runner:    the application context and the per-cycle orchestration
pub mod builtin;
pub mod discovery;
pub mod executor;
pub mod registry;
pub mod runner;
