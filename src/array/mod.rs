//! # Array Schema Data Model
//!
//! The immutable description of an array: datatype descriptors,
//! dimensions, attributes, and the schema binding them together with cell
//! order, tile order, capacity, and the dense/sparse array type.
//!
//! Everything here is a value type. The storage manager installs a schema
//! into an open-array entry behind an `Arc` once, at open time; from then
//! on it is read-only for the entry's lifetime.

pub mod attribute;
pub mod datatype;
pub mod dimension;
pub mod schema;

pub use attribute::{Attribute, Filter};
pub use datatype::Datatype;
pub use dimension::Dimension;
pub use schema::{ArraySchema, ArrayType, Layout};
