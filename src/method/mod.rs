pub mod method_def;
pub mod registry;
