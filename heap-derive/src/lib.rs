//! `#[derive(HeapCost)]` for script values and native companions.
//!
//! Every field counts toward the reported cost unless it is marked
//! `#[heap(skip)]`. Type parameters get a `HeapCost` bound.
//!
//! ```ignore
//! #[derive(DeriveHeapCost)]
//! enum Value {
//!     Undefined,
//!     Text(String),
//!     Bytes(bytes::Bytes),
//!     Handle {
//!         #[heap(skip)]
//!         slot: u32,
//!     },
//! }
//! ```
//!
//! `#[heap(crate = "crate")]` on the type points the generated impl at a
//! different path for the runtime crate.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Fields, Path, parse_macro_input, parse_quote};

#[proc_macro_derive(HeapCost, attributes(heap))]
pub fn derive_heap_cost(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(mut input: DeriveInput) -> syn::Result<TokenStream2> {
    let runtime = runtime_path(&input.attrs)?;

    for param in input.generics.type_params_mut() {
        param.bounds.push(parse_quote!(#runtime::HeapCost));
    }

    let arms = match &input.data {
        Data::Struct(data) => vec![arm(quote!(Self), &data.fields, &runtime)?],
        Data::Enum(data) => data
            .variants
            .iter()
            .map(|variant| {
                let ident = &variant.ident;
                arm(quote!(Self::#ident), &variant.fields, &runtime)
            })
            .collect::<syn::Result<_>>()?,
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                &input.ident,
                "HeapCost cannot be derived for unions",
            ));
        }
    };

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let body = if arms.is_empty() {
        quote!(match *self {})
    } else {
        quote!(match self { #(#arms)* })
    };

    Ok(quote! {
        impl #impl_generics #runtime::HeapCost for #name #ty_generics #where_clause {
            fn heap_cost(&self) -> usize {
                #body
            }
        }
    })
}

/// `pattern => sum of counted bindings,`
fn arm(pattern: TokenStream2, fields: &Fields, runtime: &Path) -> syn::Result<TokenStream2> {
    let mut bindings = Vec::new();
    let mut counted = Vec::new();

    for (index, field) in fields.iter().enumerate() {
        let binding = if is_skipped(&field.attrs)? {
            quote!(_)
        } else {
            let binding = format_ident!("__field{}", index);
            counted.push(quote!(#runtime::HeapCost::heap_cost(#binding)));
            quote!(#binding)
        };
        bindings.push((field.ident.as_ref(), binding));
    }

    let destructure = match fields {
        Fields::Named(_) => {
            let pairs = bindings.iter().map(|(ident, binding)| quote!(#ident: #binding));
            quote!(#pattern { #(#pairs),* })
        }
        Fields::Unnamed(_) => {
            let names = bindings.iter().map(|(_, binding)| binding);
            quote!(#pattern( #(#names),* ))
        }
        Fields::Unit => pattern,
    };

    Ok(quote! {
        #destructure => 0usize #(+ #counted)*,
    })
}

fn runtime_path(attrs: &[Attribute]) -> syn::Result<Path> {
    let mut path = None;
    for attr in attrs.iter().filter(|a| a.path().is_ident("heap")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let lit: syn::LitStr = meta.value()?.parse()?;
                path = Some(lit.parse::<Path>()?);
                Ok(())
            } else {
                Err(meta.error("expected `crate = \"...\"`"))
            }
        })?;
    }
    Ok(path.unwrap_or_else(|| parse_quote!(::panel_script_runtime)))
}

fn is_skipped(attrs: &[Attribute]) -> syn::Result<bool> {
    let mut skip = false;
    for attr in attrs.iter().filter(|a| a.path().is_ident("heap")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("expected `skip`"))
            }
        })?;
    }
    Ok(skip)
}
