//! `#[host_methods]`: attribute macro for impl blocks.
//!
//! Exposes every `pub fn` taking `&self` or `&mut self` to scripts. The impl
//! block is re-emitted (minus `#[host(...)]` attributes) together with two
//! inherent functions:
//!
//! - `__host_methods()`: the static method table read by `Describe`
//! - `__host_invoke(&mut self, index, args)`: converts arguments, calls the
//!   method at `index` and converts its results
//!
//! Both shadow the blanket `MethodProvider` defaults used by records without
//! methods.
//!
//! # Parameters
//! Any `T: FromHost` by value; `&T` is converted into an owned `T` first
//! (`&str` through `String`). `&mut T` is rejected.
//!
//! # Return values
//! - `()`: no results
//! - `Result<T, E>`: `Err` becomes a script error, `Ok` is converted as `T`
//! - tuples: one result per element
//! - anything else: one result through `IntoHost`
//!
//! # Example
//! ```ignore
//! #[host_methods]
//! impl Counter {
//!     pub fn add(&mut self, amount: i64) -> i64 {
//!         self.count += amount;
//!         self.count
//!     }
//!     #[host(name = "describe")]
//!     pub fn summary(&self) -> String {
//!         format!("{} = {}", self.name, self.count)
//!     }
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{FnArg, ItemImpl, ReturnType, Type, parse_macro_input};

use crate::type_utils::{ParamKind, param_kind, parse_host_attrs, return_to_host};

/// Information about a single exported method.
struct MethodInfo {
    rust_name: syn::Ident,
    alias: Option<String>,
    params: Vec<ParamKind>,
    return_type: Option<Type>,
}

/// Entry point for `#[host_methods]`.
pub fn host_methods_impl(input: TokenStream) -> TokenStream {
    let mut item_impl = parse_macro_input!(input as ItemImpl);
    match expand(&mut item_impl) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(item_impl: &mut ItemImpl) -> syn::Result<TokenStream2> {
    if item_impl.trait_.is_some() {
        return Err(syn::Error::new_spanned(
            &item_impl.self_ty,
            "#[host_methods] applies to inherent impl blocks only",
        ));
    }

    let mut methods: Vec<MethodInfo> = Vec::new();
    for item in &mut item_impl.items {
        let syn::ImplItem::Fn(method) = item else {
            continue;
        };
        let attrs = parse_host_attrs(&method.attrs)?;
        method.attrs.retain(|attr| !attr.path().is_ident("host"));

        if attrs.skip || !matches!(method.vis, syn::Visibility::Public(_)) {
            continue;
        }
        let sig = &method.sig;
        if sig.asyncness.is_some() || !sig.generics.params.is_empty() {
            continue;
        }
        // Must borrow self; associated functions and `self` by value are skipped
        match sig.inputs.first() {
            Some(FnArg::Receiver(receiver)) if receiver.reference.is_some() => {}
            _ => continue,
        }

        let mut params = Vec::new();
        for arg in sig.inputs.iter().skip(1) {
            if let FnArg::Typed(pat_type) = arg {
                params.push(param_kind(&pat_type.ty)?);
            }
        }

        let return_type = match &sig.output {
            ReturnType::Default => None,
            ReturnType::Type(_, ty) => Some((**ty).clone()),
        };

        methods.push(MethodInfo {
            rust_name: sig.ident.clone(),
            alias: attrs.name,
            params,
            return_type,
        });
    }

    let self_ty = &item_impl.self_ty;

    let descriptors = methods.iter().map(|m| {
        let name = m.rust_name.to_string();
        let alias = match &m.alias {
            Some(alias) => quote!(::core::option::Option::Some(#alias)),
            None => quote!(::core::option::Option::None),
        };
        let arity = m.params.len();
        quote! {
            ::hostlua::MethodDescriptor {
                name: #name,
                alias: #alias,
                arity: #arity,
            },
        }
    });

    let invoke_arms = methods.iter().enumerate().map(|(i, m)| gen_invoke_arm(i, m));

    Ok(quote! {
        #item_impl

        impl #self_ty {
            #[doc(hidden)]
            pub fn __host_methods() -> &'static [::hostlua::MethodDescriptor] {
                static METHODS: &[::hostlua::MethodDescriptor] = &[#(#descriptors)*];
                METHODS
            }

            #[doc(hidden)]
            #[allow(unused_mut, unused_variables)]
            pub fn __host_invoke(
                &mut self,
                method: usize,
                args: ::std::vec::Vec<::hostlua::HostValue>,
            ) -> ::hostlua::BridgeResult<::std::vec::Vec<::hostlua::HostValue>> {
                let mut args = args.into_iter();
                match method {
                    #(#invoke_arms)*
                    _ => ::core::result::Result::Err(::hostlua::BridgeError::Host(
                        ::std::format!("no method with index {}", method),
                    )),
                }
            }
        }
    })
}

fn gen_invoke_arm(index: usize, method: &MethodInfo) -> TokenStream2 {
    let rust_name = &method.rust_name;
    let method_name = rust_name.to_string();

    let mut extractions = Vec::new();
    let mut call_args = Vec::new();
    for (i, param) in method.params.iter().enumerate() {
        let arg = format_ident!("__arg{}", i);
        let position = i + 1;
        let (ty, pass) = match param {
            ParamKind::Owned(ty) => (ty, quote!(#arg)),
            ParamKind::Borrowed(ty) => (ty, quote!(&#arg)),
        };
        extractions.push(quote! {
            let #arg: #ty = ::hostlua::FromHost::from_host(
                args.next().unwrap_or(::hostlua::HostValue::Nil),
            )
            .map_err(|err| err.in_argument(#method_name, #position))?;
        });
        call_args.push(pass);
    }

    let convert = return_to_host(method.return_type.as_ref(), quote!(__result));
    quote! {
        #index => {
            #(#extractions)*
            let __result = self.#rust_name(#(#call_args),*);
            #convert
        }
    }
}
