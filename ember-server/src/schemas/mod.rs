//! Request / response types for the HTTP surface.

pub mod api;
pub mod v1;
