pub mod resource_id;
pub mod resource_info;
pub mod resource_registry;
