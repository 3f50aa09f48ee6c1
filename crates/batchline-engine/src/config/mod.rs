//! Declarative pipeline definitions: in-memory types, YAML parsing,
//! and structural validation.

pub mod parser;
pub mod types;
pub mod validator;
