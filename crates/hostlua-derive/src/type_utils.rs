//! Shared type helpers for hostlua-derive.
//!
//! Used by `#[derive(HostRecord)]` (attribute parsing) and `#[host_methods]`
//! (parameter and return value conversion).

use proc_macro2::TokenStream;
use quote::quote;
use syn::{Attribute, GenericArgument, PathArguments, Type};

/// Normalize a `syn::Type` to a simple string for matching.
///
/// Strips whitespace so `Option < i64 >` becomes `Option<i64>`.
pub fn normalize_type(ty: &Type) -> String {
    quote!(#ty).to_string().replace(' ', "")
}

/// Options parsed from `#[host(...)]`.
#[derive(Default)]
pub struct HostAttrs {
    pub skip: bool,
    pub readonly: bool,
    pub flatten: bool,
    pub name: Option<String>,
}

/// Collect every `#[host(...)]` on an item.
pub fn parse_host_attrs(attrs: &[Attribute]) -> syn::Result<HostAttrs> {
    let mut out = HostAttrs::default();
    for attr in attrs {
        if !attr.path().is_ident("host") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                out.skip = true;
            } else if meta.path.is_ident("readonly") {
                out.readonly = true;
            } else if meta.path.is_ident("flatten") {
                out.flatten = true;
            } else if meta.path.is_ident("name") {
                let lit: syn::LitStr = meta.value()?.parse()?;
                out.name = Some(lit.value());
            } else {
                return Err(meta.error("expected `skip`, `readonly`, `flatten` or `name = \"...\"`"));
            }
            Ok(())
        })?;
    }
    Ok(out)
}

/// Trait names listed in `#[host_impl(...)]` on a struct.
pub fn parse_host_impl_attrs(attrs: &[Attribute]) -> syn::Result<Vec<String>> {
    let mut impls = Vec::new();
    for attr in attrs {
        if !attr.path().is_ident("host_impl") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            match meta.path.get_ident() {
                Some(ident) if ident == "Clone" => impls.push(ident.to_string()),
                _ => return Err(meta.error("expected `Clone`")),
            }
            Ok(())
        })?;
    }
    Ok(impls)
}

/// The `rename` of a `#[serde(rename = "...")]` attribute, if present.
///
/// Other serde options are ignored.
pub fn serde_rename(attrs: &[Attribute]) -> Option<String> {
    let mut rename = None;
    for attr in attrs {
        if !attr.path().is_ident("serde") {
            continue;
        }
        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") {
                if let Ok(value) = meta.value() {
                    if let Ok(lit) = value.parse::<syn::LitStr>() {
                        rename = Some(lit.value());
                    }
                }
            } else if meta.input.peek(syn::Token![=]) {
                // skip `key = value` options we don't understand
                let _: syn::Expr = meta.value()?.parse()?;
            }
            Ok(())
        });
    }
    rename
}

/// Generic arguments of the last path segment, if `ty` is `Name<...>`.
fn generic_args<'a>(ty: &'a Type, name: &str) -> Option<Vec<&'a Type>> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != name {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    Some(
        args.args
            .iter()
            .filter_map(|arg| match arg {
                GenericArgument::Type(ty) => Some(ty),
                _ => None,
            })
            .collect(),
    )
}

fn is_unit(ty: &Type) -> bool {
    matches!(ty, Type::Tuple(tuple) if tuple.elems.is_empty())
}

/// How a method parameter is produced from a `HostValue`.
pub enum ParamKind {
    /// Converted and passed by value
    Owned(Type),
    /// Converted into the owned type, then passed by shared reference
    Borrowed(Type),
}

pub fn param_kind(ty: &Type) -> syn::Result<ParamKind> {
    match ty {
        Type::Reference(reference) if reference.mutability.is_some() => Err(syn::Error::new_spanned(
            ty,
            "`&mut` parameters cannot be filled from script values; take `Shared<T>` instead",
        )),
        Type::Reference(reference) => {
            let inner = &*reference.elem;
            if normalize_type(inner) == "str" {
                Ok(ParamKind::Borrowed(syn::parse_quote!(::std::string::String)))
            } else {
                Ok(ParamKind::Borrowed(inner.clone()))
            }
        }
        other => Ok(ParamKind::Owned(other.clone())),
    }
}

/// Generate code turning `value` (of type `ty`) into `BridgeResult<Vec<HostValue>>`.
pub fn return_to_host(ty: Option<&Type>, value: TokenStream) -> TokenStream {
    let Some(ty) = ty else {
        return quote! { { let _ = #value; Ok(::std::vec::Vec::new()) } };
    };
    if is_unit(ty) {
        return quote! { { let _ = #value; Ok(::std::vec::Vec::new()) } };
    }

    if let Some(args) = generic_args(ty, "BridgeResult") {
        let ok = return_to_host(args.first().copied(), quote!(__ok));
        return quote! {
            match #value {
                Ok(__ok) => #ok,
                Err(__err) => Err(__err),
            }
        };
    }
    if let Some(args) = generic_args(ty, "Result") {
        let ok = return_to_host(args.first().copied(), quote!(__ok));
        let passthrough = args
            .get(1)
            .is_some_and(|err| normalize_type(err).ends_with("BridgeError"));
        let err = if passthrough {
            quote!(__err)
        } else {
            quote!(::hostlua::BridgeError::Host(::std::string::ToString::to_string(&__err)))
        };
        return quote! {
            match #value {
                Ok(__ok) => #ok,
                Err(__err) => Err(#err),
            }
        };
    }

    if let Type::Tuple(tuple) = ty {
        let names: Vec<_> = (0..tuple.elems.len())
            .map(|i| quote::format_ident!("__ret{}", i))
            .collect();
        return quote! {
            {
                let (#(#names,)*) = #value;
                Ok(::std::vec![#(::hostlua::IntoHost::into_host(#names)),*])
            }
        };
    }

    quote! { Ok(::std::vec![::hostlua::IntoHost::into_host(#value)]) }
}
