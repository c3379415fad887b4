pub(crate) mod decimal;
pub(crate) mod instruction;
pub(crate) mod message;
pub(crate) mod types;
pub(crate) mod value;
