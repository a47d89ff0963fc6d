//! # flightwire Derive Macros
//!
//! This crate provides the procedural macros for `flightwire`. It automates the
//! implementation of `IntoModel`, which turns a plain struct into graph values.
//!
//! Compatible with `syn 2.0`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, LitStr, parse_macro_input};

/// Derives `flightwire::model::IntoModel`.
///
/// Named structs become objects keyed by field name, tuple structs become
/// arrays, unit structs become empty objects.
///
/// Field attributes:
/// * `#[flight(rename = "key")]`: use `key` as the object key.
/// * `#[flight(skip)]`: leave the field out.
/// * `#[flight(bytes)]`: write a byte collection as a `Uint8Array`.
#[proc_macro_derive(FlightModel, attributes(flight))]
pub fn derive_flight_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let data_struct = match input.data {
        Data::Struct(ds) => ds,
        _ => {
            return syn::Error::new(name.span(), "FlightModel only supports structs")
                .to_compile_error()
                .into();
        }
    };

    let mut fields = Vec::new();
    for (index, field) in data_struct.fields.iter().enumerate() {
        let options = match parse_attributes(&field.attrs) {
            Ok(options) => options,
            Err(e) => return e.to_compile_error().into(),
        };
        if options.skip {
            continue;
        }
        let access = match &field.ident {
            Some(ident) => quote! { self.#ident },
            None => {
                let index = syn::Index::from(index);
                quote! { self.#index }
            }
        };
        let key = options
            .rename
            .or_else(|| field.ident.as_ref().map(|ident| ident_key(ident)))
            .unwrap_or_default();
        fields.push(ModelField {
            key,
            access,
            bytes: options.bytes,
        });
    }

    let body = match data_struct.fields {
        Fields::Unnamed(_) => generate_array(&fields),
        Fields::Named(_) | Fields::Unit => generate_object(&fields),
    };

    let expanded = quote! {
        impl #impl_generics ::flightwire::model::IntoModel for #name #ty_generics #where_clause {
            fn into_model(&self, graph: &::flightwire::Graph) -> ::flightwire::Value {
                #body
            }
        }
    };

    TokenStream::from(expanded)
}

// --- Internal Data Structures ---
struct ModelField {
    key: String,
    access: proc_macro2::TokenStream,
    bytes: bool,
}

#[derive(Default)]
struct FieldOptions {
    rename: Option<String>,
    skip: bool,
    bytes: bool,
}

fn parse_attributes(attrs: &[Attribute]) -> syn::Result<FieldOptions> {
    let mut options = FieldOptions::default();

    for attr in attrs {
        if attr.path().is_ident("flight") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    options.skip = true;
                    return Ok(());
                }

                if meta.path.is_ident("bytes") {
                    options.bytes = true;
                    return Ok(());
                }

                if meta.path.is_ident("rename") {
                    let value = meta.value()?;
                    let s: LitStr = value.parse()?;
                    options.rename = Some(s.value());
                    return Ok(());
                }
                Err(meta.error("Unknown flight attribute key. Supported: rename, skip, bytes"))
            })?;
        }
    }
    Ok(options)
}

// Raw identifiers keep their `r#` prefix in `to_string`.
fn ident_key(ident: &syn::Ident) -> String {
    let text = ident.to_string();
    text.strip_prefix("r#").map(str::to_string).unwrap_or(text)
}

fn field_value(field: &ModelField) -> proc_macro2::TokenStream {
    let access = &field.access;
    if field.bytes {
        quote! { ::flightwire::model::bytes_model(&#access) }
    } else {
        quote! { ::flightwire::model::IntoModel::into_model(&#access, graph) }
    }
}

// --- Generators ---

fn generate_object(fields: &[ModelField]) -> proc_macro2::TokenStream {
    let entries = fields.iter().map(|field| {
        let key = &field.key;
        let value = field_value(field);
        quote! { (#key, #value) }
    });
    quote! {
        let fields: ::std::vec::Vec<(&'static str, ::flightwire::Value)> = ::std::vec![#(#entries),*];
        graph.object(fields)
    }
}

fn generate_array(fields: &[ModelField]) -> proc_macro2::TokenStream {
    let items = fields.iter().map(field_value);
    quote! {
        let items: ::std::vec::Vec<::flightwire::Value> = ::std::vec![#(#items),*];
        graph.array(items)
    }
}
