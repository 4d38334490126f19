//! The array data model: dimensions, attributes, domains and schemas.

mod attribute;
pub use attribute::*;

mod dimension;
pub use dimension::*;

mod domain_impl;
pub use domain_impl::*;

mod filters;
pub use filters::*;

mod layout;
pub use layout::*;

mod schema;
pub use schema::*;
