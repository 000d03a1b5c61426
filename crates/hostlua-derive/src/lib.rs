//! Procedural macros for the hostlua bridge.
//!
//! Provides `#[derive(HostRecord)]`, which describes a struct's fields to the
//! bridge, and `#[host_methods]`, which describes and dispatches the methods
//! of an impl block.
//!
//! # Example
//!
//! ```ignore
//! use hostlua::{HostRecord, host_methods};
//!
//! #[derive(HostRecord)]
//! pub struct Player {
//!     pub name: String,
//!     #[host(name = "hp")]
//!     pub health: i64,
//!     #[host(readonly)]
//!     pub id: u32,
//!     #[host(skip)]
//!     pub session: u64,
//! }
//!
//! #[host_methods]
//! impl Player {
//!     pub fn heal(&mut self, amount: i64) -> i64 {
//!         self.health += amount;
//!         self.health
//!     }
//! }
//! ```

mod derive_record;
mod host_methods;
mod type_utils;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Derive the record shape (`Describe`, `Record`, `HostObject`, `IntoHost`).
///
/// With `#[host_impl(Clone)]` the record also gets `FromHost`. See the module
/// docs of `derive_record` for field attributes.
#[proc_macro_derive(HostRecord, attributes(host, host_impl, serde))]
pub fn derive_host_record(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    derive_record::derive_host_record_impl(input)
}

/// Expose the `pub` methods of an inherent impl block to scripts.
#[proc_macro_attribute]
pub fn host_methods(_attr: TokenStream, item: TokenStream) -> TokenStream {
    host_methods::host_methods_impl(item)
}
