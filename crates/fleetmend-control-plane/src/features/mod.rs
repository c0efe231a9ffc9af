pub mod host_resolution;
pub mod instance_management;
pub mod observability;
pub mod relocation;
pub mod security_groups;
pub mod server_actions;
pub mod server_groups;
pub mod version_registry;
