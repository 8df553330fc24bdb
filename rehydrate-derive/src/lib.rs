//! # Rehydrate Derive Macros
//!
//! This crate provides the procedural macros for `rehydrate`. It automates the implementation
//! of `Serializable`, `Identified`, and the by-value `ToValue` / `FromValue` conversions.
//!
//! Compatible with `syn 2.0`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, Ident, LitStr, Path, parse_macro_input};

/// Derives `Serializable` (and `Identified`, `ToValue`, `FromValue`) for a struct with named
/// fields.
///
/// Struct attributes, under `#[serializable(...)]`:
/// * `name = "..."`: registered type name (defaults to the struct name).
/// * `identity = "field"`: makes the type externalizable, identified by `field`.
/// * `no_inline`: skips the by-value `ToValue`/`FromValue` impls (needed for non-`Clone` types,
///   which are then only reachable through `Handle<T>`).
///
/// Field attributes:
/// * `ignore`: not persisted; restored as `Default::default()`.
/// * `soft`: references under the field stay lazy (use `Link<T>`).
/// * `transform = "path::to::fn"`: a `fn() -> rehydrate::Transform` applied to the field.
#[proc_macro_derive(Serializable, attributes(serializable))]
pub fn derive_serializable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(e) => e.to_compile_error().into(),
    }
}

// --- Internal Data Structures ---

#[derive(Default)]
struct TypeAttrs {
    name: Option<String>,
    identity: Option<Ident>,
    no_inline: bool,
}

#[derive(Default)]
struct FieldAttrs {
    ignore: bool,
    soft: bool,
    transform: Option<Path>,
}

struct StoredField {
    ident: Ident,
    key: String,
    attrs: FieldAttrs,
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "Serializable cannot be derived for generic types; implement it by hand",
        ));
    }
    let data_struct = match &input.data {
        Data::Struct(ds) => ds,
        _ => {
            return Err(syn::Error::new(
                name.span(),
                "Serializable only supports structs",
            ));
        }
    };

    let type_attrs = parse_type_attributes(&input.attrs)?;
    let mut fields = Vec::new();
    match &data_struct.fields {
        Fields::Named(named) => {
            for field in &named.named {
                let Some(ident) = field.ident.clone() else {
                    continue;
                };
                fields.push(StoredField {
                    key: ident.to_string().trim_start_matches("r#").to_owned(),
                    ident,
                    attrs: parse_field_attributes(&field.attrs)?,
                });
            }
        }
        Fields::Unit => {}
        Fields::Unnamed(unnamed) => {
            return Err(syn::Error::new_spanned(
                unnamed,
                "Serializable requires named fields",
            ));
        }
    }

    if let Some(identity) = &type_attrs.identity
        && !fields.iter().any(|f| &f.ident == identity && !f.attrs.ignore)
    {
        return Err(syn::Error::new(
            identity.span(),
            "identity must name a persisted field of this struct",
        ));
    }

    let type_name = type_attrs.name.clone().unwrap_or_else(|| name.to_string());
    let impl_serializable = generate_serializable(name, &type_name, &type_attrs, &fields);
    let impl_identified = generate_identified(name, &type_attrs);
    let impl_values = generate_value_conversions(name, &type_attrs);

    Ok(quote! {
        #impl_serializable
        #impl_identified
        #impl_values
    })
}

fn parse_type_attributes(attrs: &[Attribute]) -> syn::Result<TypeAttrs> {
    let mut out = TypeAttrs::default();
    for attr in attrs {
        if attr.path().is_ident("serializable") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    let s: LitStr = meta.value()?.parse()?;
                    out.name = Some(s.value());
                    return Ok(());
                }

                if meta.path.is_ident("identity") {
                    let s: LitStr = meta.value()?.parse()?;
                    out.identity = Some(s.parse()?);
                    return Ok(());
                }

                if meta.path.is_ident("no_inline") {
                    out.no_inline = true;
                    return Ok(());
                }
                Err(meta.error(
                    "Unknown serializable attribute key. Supported: name, identity, no_inline",
                ))
            })?;
        }
    }
    Ok(out)
}

fn parse_field_attributes(attrs: &[Attribute]) -> syn::Result<FieldAttrs> {
    let mut out = FieldAttrs::default();
    for attr in attrs {
        if attr.path().is_ident("serializable") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("ignore") {
                    out.ignore = true;
                    return Ok(());
                }

                if meta.path.is_ident("soft") {
                    out.soft = true;
                    return Ok(());
                }

                if meta.path.is_ident("transform") {
                    let s: LitStr = meta.value()?.parse()?;
                    out.transform = Some(s.parse()?);
                    return Ok(());
                }
                Err(meta.error(
                    "Unknown serializable field attribute key. Supported: ignore, soft, transform",
                ))
            })?;
        }
    }
    Ok(out)
}

// --- Generator: Serializable ---

fn generate_serializable(
    name: &Ident,
    type_name: &str,
    type_attrs: &TypeAttrs,
    fields: &[StoredField],
) -> proc_macro2::TokenStream {
    let stored: Vec<&StoredField> = fields.iter().filter(|f| !f.attrs.ignore).collect();

    let flatten_stmts = stored.iter().map(|f| {
        let ident = &f.ident;
        let key = &f.key;
        quote! { rehydrate::rt::insert(&mut fields, #key, &self.#ident); }
    });

    let construct_fields = fields.iter().map(|f| {
        let ident = &f.ident;
        let key = &f.key;
        if f.attrs.ignore {
            quote! { #ident: ::core::default::Default::default() }
        } else {
            quote! { #ident: rehydrate::rt::field(fields, Self::TYPE_NAME, #key)? }
        }
    });

    let assign_stmts = stored.iter().map(|f| {
        let ident = &f.ident;
        let key = &f.key;
        quote! { rehydrate::rt::assign(&mut self.#ident, fields, Self::TYPE_NAME, #key)?; }
    });

    let overrides = fields.iter().flat_map(|f| {
        let key = &f.key;
        let mut out = Vec::new();
        if f.attrs.ignore {
            out.push(quote! { (#key, rehydrate::PropertyOverride::ignore()) });
        }
        if f.attrs.soft {
            out.push(quote! { (#key, rehydrate::PropertyOverride::soft_reference()) });
        }
        if let Some(path) = &f.attrs.transform {
            out.push(quote! { (#key, rehydrate::PropertyOverride::transformed(#path())) });
        }
        out
    });

    let describe = if type_attrs.identity.is_some() {
        quote! {
            fn describe() -> rehydrate::TypeDescriptor {
                rehydrate::TypeDescriptor::builder::<Self>().identified().build()
            }
        }
    } else {
        quote! {}
    };

    quote! {
        impl rehydrate::Serializable for #name {
            const TYPE_NAME: &'static str = #type_name;

            #[allow(unused_mut)]
            fn flatten(&self) -> rehydrate::Result<rehydrate::Fields> {
                let mut fields = rehydrate::Fields::new();
                #(#flatten_stmts)*
                Ok(fields)
            }

            #[allow(unused_variables)]
            fn construct(fields: &rehydrate::Fields) -> rehydrate::Result<Self> {
                Ok(Self { #(#construct_fields),* })
            }

            #[allow(unused_variables)]
            fn assign(&mut self, fields: &rehydrate::Fields) -> rehydrate::Result<()> {
                #(#assign_stmts)*
                Ok(())
            }

            #describe

            fn property_overrides() -> ::std::vec::Vec<(&'static str, rehydrate::PropertyOverride)> {
                ::std::vec![#(#overrides),*]
            }
        }
    }
}

// --- Generator: Identified ---

fn generate_identified(name: &Ident, type_attrs: &TypeAttrs) -> proc_macro2::TokenStream {
    match &type_attrs.identity {
        Some(field) => quote! {
            impl rehydrate::Identified for #name {
                fn identity(&self) -> ::std::string::String {
                    ::std::string::ToString::to_string(&self.#field)
                }
            }
        },
        None => quote! {},
    }
}

// --- Generator: ToValue / FromValue ---

fn generate_value_conversions(name: &Ident, type_attrs: &TypeAttrs) -> proc_macro2::TokenStream {
    if type_attrs.no_inline {
        return quote! {};
    }
    quote! {
        impl rehydrate::ToValue for #name {
            fn to_value(&self) -> rehydrate::Value {
                rehydrate::rt::object_to_value(self)
            }
        }

        impl rehydrate::FromValue for #name {
            fn from_value(value: rehydrate::Value) -> rehydrate::Result<Self> {
                rehydrate::rt::object_from_value(value)
            }
        }
    }
}
