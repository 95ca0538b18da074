pub mod assemble;
pub(crate) mod deserializer;
pub mod name;
pub(crate) mod template;
pub mod value_variant;
