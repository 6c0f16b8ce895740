pub mod report;
pub mod site;
pub mod snapshot;
pub mod treatment;

// Re-exports for convenience
pub use report::*;
pub use site::*;
pub use snapshot::*;
pub use treatment::*;

// Helper function to generate record ids
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
