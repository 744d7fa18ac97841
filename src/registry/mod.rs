pub mod translation;
pub mod type_registry;
