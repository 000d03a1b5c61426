//! `#[derive(HostRecord)]`: shape metadata and field access for host records.
//!
//! Generates `Describe`, `Record`, `HostObject` and `IntoHost` for a struct
//! with named fields. Only `pub` fields are exported.
//!
//! # Container attributes
//! - `#[host_impl(Clone)]`: the struct implements `Clone`; also generate
//!   `FromHost`, which copies the record out of a handle. Needed for
//!   `Vec<T>`, maps of `T`, record-typed fields and by-value method parameters.
//!
//! # Field attributes
//! - `#[host(skip)]`: exclude the field
//! - `#[host(readonly)]`: reads only; script writes are refused
//! - `#[host(name = "...")]`: alias matched verbatim, ahead of the declared name
//! - `#[host(flatten)]`: the field is itself a `HostRecord` whose members are
//!   promoted into this one
//!
//! `#[serde(rename = "...")]` is used as the alias when no `#[host(name)]` is given.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Ident, Type};

use crate::type_utils::{parse_host_attrs, parse_host_impl_attrs, serde_rename};

/// Internal field metadata collected during parsing.
struct FieldInfo {
    ident: Ident,
    ty: Type,
    alias: Option<String>,
    readonly: bool,
    flatten: bool,
}

/// Entry point for `#[derive(HostRecord)]`.
pub fn derive_host_record_impl(input: DeriveInput) -> TokenStream {
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "HostRecord cannot be derived for generic types",
        ));
    }

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    name,
                    "HostRecord can only be derived for structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                name,
                "HostRecord can only be derived for structs",
            ));
        }
    };

    let trait_impls = parse_host_impl_attrs(&input.attrs)?;

    let mut field_infos: Vec<FieldInfo> = Vec::new();
    for field in fields {
        let attrs = parse_host_attrs(&field.attrs)?;
        let is_pub = matches!(field.vis, syn::Visibility::Public(_));
        if attrs.skip || !is_pub {
            continue;
        }
        let Some(ident) = field.ident.clone() else {
            continue;
        };
        field_infos.push(FieldInfo {
            ident,
            ty: field.ty.clone(),
            alias: attrs.name.or_else(|| serde_rename(&field.attrs)),
            readonly: attrs.readonly,
            flatten: attrs.flatten,
        });
    }

    let type_name = name.to_string();

    // ==================== Describe ====================

    let field_descriptors = field_infos.iter().map(|f| {
        let field_name = f.ident.to_string();
        let alias = match &f.alias {
            Some(alias) => quote!(::core::option::Option::Some(#alias)),
            None => quote!(::core::option::Option::None),
        };
        let readonly = f.readonly;
        let flatten = if f.flatten {
            let ty = &f.ty;
            quote! {
                ::core::option::Option::Some(
                    <#ty as ::hostlua::Describe>::describe as fn() -> &'static ::hostlua::TypeDescriptor
                )
            }
        } else {
            quote!(::core::option::Option::None)
        };
        quote! {
            ::hostlua::FieldDescriptor {
                name: #field_name,
                alias: #alias,
                readonly: #readonly,
                flatten: #flatten,
            },
        }
    });

    // ==================== Field access ====================

    let get_field_arms = field_infos.iter().enumerate().filter(|(_, f)| !f.flatten).map(|(i, f)| {
        let ident = &f.ident;
        quote! {
            #i => ::core::option::Option::Some(
                ::hostlua::IntoHost::into_host(::core::clone::Clone::clone(&self.#ident))
            ),
        }
    });

    let field_object_arms: Vec<TokenStream2> = field_infos
        .iter()
        .enumerate()
        .filter(|(_, f)| !f.flatten)
        .map(|(i, f)| {
            let ident = &f.ident;
            quote! { #i => ::hostlua::IntoHost::as_host_object(&self.#ident), }
        })
        .collect();

    let field_object_mut_arms = field_infos.iter().enumerate().filter(|(_, f)| !f.flatten).map(|(i, f)| {
        let ident = &f.ident;
        quote! { #i => ::hostlua::IntoHost::as_host_object_mut(&mut self.#ident), }
    });

    let field_object_impl = if field_object_arms.is_empty() {
        quote!()
    } else {
        quote! {
            fn field_object(&self, index: usize) -> ::core::option::Option<&dyn ::hostlua::HostObject> {
                match index {
                    #(#field_object_arms)*
                    _ => ::core::option::Option::None,
                }
            }

            fn field_object_mut(&mut self, index: usize) -> ::core::option::Option<&mut dyn ::hostlua::HostObject> {
                match index {
                    #(#field_object_mut_arms)*
                    _ => ::core::option::Option::None,
                }
            }
        }
    };

    // ==================== Conversions ====================

    let from_host_impl = if trait_impls.iter().any(|t| t == "Clone") {
        quote! {
            impl ::hostlua::FromHost for #name {
                fn from_host(value: ::hostlua::HostValue) -> ::hostlua::BridgeResult<Self> {
                    let shared = <::hostlua::Shared<Self> as ::hostlua::FromHost>::from_host(value)?;
                    let copy = ::core::clone::Clone::clone(&*shared.lock());
                    ::core::result::Result::Ok(copy)
                }
            }
        }
    } else {
        quote!()
    };

    let set_field_arms = field_infos.iter().enumerate().map(|(i, f)| {
        let ident = &f.ident;
        let field_name = f.ident.to_string();
        if f.readonly || f.flatten {
            quote! {
                #i => ::core::result::Result::Err(::hostlua::BridgeError::ReadOnly {
                    type_name: #type_name.to_string(),
                    member: #field_name.to_string(),
                }),
            }
        } else {
            quote! {
                #i => {
                    self.#ident = ::hostlua::FromHost::from_host(value)?;
                    ::core::result::Result::Ok(())
                }
            }
        }
    });

    let embedded_arms: Vec<TokenStream2> = field_infos
        .iter()
        .enumerate()
        .filter(|(_, f)| f.flatten)
        .map(|(i, f)| {
            let ident = &f.ident;
            quote! { #i => ::core::option::Option::Some(&self.#ident as &dyn ::hostlua::Record), }
        })
        .collect();

    let embedded_mut_arms = field_infos.iter().enumerate().filter(|(_, f)| f.flatten).map(|(i, f)| {
        let ident = &f.ident;
        quote! { #i => ::core::option::Option::Some(&mut self.#ident as &mut dyn ::hostlua::Record), }
    });

    let embedded_impl = if embedded_arms.is_empty() {
        quote!()
    } else {
        quote! {
            fn embedded(&self, index: usize) -> ::core::option::Option<&dyn ::hostlua::Record> {
                match index {
                    #(#embedded_arms)*
                    _ => ::core::option::Option::None,
                }
            }

            fn embedded_mut(&mut self, index: usize) -> ::core::option::Option<&mut dyn ::hostlua::Record> {
                match index {
                    #(#embedded_mut_arms)*
                    _ => ::core::option::Option::None,
                }
            }
        }
    };

    Ok(quote! {
        impl ::hostlua::Describe for #name {
            fn describe() -> &'static ::hostlua::TypeDescriptor {
                fn __methods() -> &'static [::hostlua::MethodDescriptor] {
                    #[allow(unused_imports)]
                    use ::hostlua::MethodProvider as _;
                    <#name>::__host_methods()
                }

                static FIELDS: &[::hostlua::FieldDescriptor] = &[#(#field_descriptors)*];
                static DESCRIPTOR: ::hostlua::TypeDescriptor = ::hostlua::TypeDescriptor {
                    type_name: #type_name,
                    fields: FIELDS,
                    methods: __methods,
                };
                &DESCRIPTOR
            }
        }

        impl ::hostlua::Record for #name {
            fn descriptor(&self) -> &'static ::hostlua::TypeDescriptor {
                <Self as ::hostlua::Describe>::describe()
            }

            fn get_field(&self, index: usize) -> ::core::option::Option<::hostlua::HostValue> {
                match index {
                    #(#get_field_arms)*
                    _ => ::core::option::Option::None,
                }
            }

            #[allow(unused_variables)]
            fn set_field(&mut self, index: usize, value: ::hostlua::HostValue) -> ::hostlua::BridgeResult<()> {
                match index {
                    #(#set_field_arms)*
                    _ => ::core::result::Result::Err(
                        ::hostlua::BridgeError::no_such_member(#type_name, index.to_string())
                    ),
                }
            }

            #embedded_impl

            #field_object_impl

            fn invoke(
                &mut self,
                method: usize,
                args: ::std::vec::Vec<::hostlua::HostValue>,
            ) -> ::hostlua::BridgeResult<::std::vec::Vec<::hostlua::HostValue>> {
                #[allow(unused_imports)]
                use ::hostlua::MethodProvider as _;
                Self::__host_invoke(self, method, args)
            }
        }

        impl ::hostlua::HostObject for #name {
            fn type_name(&self) -> &'static str {
                #type_name
            }

            fn shape(&self) -> ::hostlua::ShapeKind {
                ::hostlua::ShapeKind::Record
            }

            fn as_record(&self) -> ::core::option::Option<&dyn ::hostlua::Record> {
                ::core::option::Option::Some(self)
            }

            fn as_record_mut(&mut self) -> ::core::option::Option<&mut dyn ::hostlua::Record> {
                ::core::option::Option::Some(self)
            }

            fn as_any(&self) -> &dyn ::core::any::Any {
                self
            }
        }

        impl ::hostlua::IntoHost for #name {
            fn into_host(self) -> ::hostlua::HostValue {
                ::hostlua::HostValue::Object(::hostlua::HostRef::by_value(self))
            }

            fn as_host_object(&self) -> ::core::option::Option<&dyn ::hostlua::HostObject> {
                ::core::option::Option::Some(self)
            }

            fn as_host_object_mut(&mut self) -> ::core::option::Option<&mut dyn ::hostlua::HostObject> {
                ::core::option::Option::Some(self)
            }
        }

        #from_host_impl
    })
}
