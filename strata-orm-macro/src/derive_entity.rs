use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Index, Member};

use crate::attrs::{is_record_marker, is_record_type, EntityAttrs, Kind};

/// Expands the `#[derive(Entity)]` macro.
///
/// This function parses the struct-level `#[entity(...)]` attributes to generate:
/// 1. The `impl Entity` block: the registry name, the declaration and `Record` access.
/// 2. One typed accessor method per declared association.
/// 3. An empty `impl Lifecycle`, unless `custom_hooks` is set.
pub fn expand(ast: DeriveInput) -> syn::Result<TokenStream> {
    let struct_name = &ast.ident;
    let entity_name = struct_name.to_string();
    let attrs = EntityAttrs::parse(&ast.attrs)?;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();

    let Data::Struct(data) = &ast.data else {
        return Err(syn::Error::new_spanned(struct_name, "Entity can only be derived for structs"));
    };
    if matches!(data.fields, Fields::Unit) {
        return Err(syn::Error::new_spanned(struct_name, "Entity needs a field holding its Record"));
    }

    // The record field: explicitly marked, or the first field typed `Record`
    let fields: Vec<_> = data.fields.iter().collect();
    let record_index = fields
        .iter()
        .position(|f| f.attrs.iter().any(is_record_marker))
        .or_else(|| fields.iter().position(|f| is_record_type(&f.ty)))
        .ok_or_else(|| syn::Error::new_spanned(struct_name, "no `Record` field; mark it with #[entity(record)]"))?;

    let record_member = match &fields[record_index].ident {
        Some(ident) => Member::Named(ident.clone()),
        None => Member::Unnamed(Index::from(record_index)),
    };

    let constructor = match &data.fields {
        Fields::Named(_) => {
            let inits = fields.iter().enumerate().map(|(i, f)| {
                let ident = &f.ident;
                if i == record_index {
                    quote! { #ident: record }
                } else {
                    quote! { #ident: ::core::default::Default::default() }
                }
            });
            quote! { Self { #(#inits),* } }
        }
        _ => {
            let inits = (0..fields.len()).map(|i| {
                if i == record_index {
                    quote! { record }
                } else {
                    quote! { ::core::default::Default::default() }
                }
            });
            quote! { Self(#(#inits),*) }
        }
    };

    let table = attrs.table.as_ref().map(|table| quote! { .table(#table) });
    let partitions = attrs.partitions.iter().map(|table| quote! { .vertical_partition(#table) });
    let serialized = attrs.serialized.iter().map(|column| quote! { .serialize(#column) });

    let associations = attrs.associations.iter().map(|a| {
        let method = format_ident!("{}", a.kind.attr_name());
        let name = a.name.to_string();
        let target = &a.target;
        let foreign_key = a.foreign_key.as_ref().map(|v| quote! { .foreign_key(#v) });
        let join_table = a.join_table.as_ref().map(|v| quote! { .join_table(#v) });
        let partner_key = a.partner_key.as_ref().map(|v| quote! { .partner_key(#v) });
        let conditions = a.conditions.as_ref().map(|v| quote! { .conditions(#v) });
        let strict = a.strict.then(|| quote! { .strict(true) });

        quote! {
            .#method(
                #name,
                ::strata_orm::AssociationOptions::new()
                    .target(<#target as ::strata_orm::Entity>::NAME)
                    #foreign_key #join_table #partner_key #conditions #strict
            )
        }
    });

    let accessors = attrs.associations.iter().map(|a| {
        let method = &a.name;
        let name = a.name.to_string();
        let target = &a.target;
        let doc = format!(" Resolves the `{name}` association.");

        match a.kind {
            Kind::HasOne => quote! {
                #[doc = #doc]
                pub async fn #method(
                    &mut self,
                    ctx: &::strata_orm::Context,
                ) -> ::core::result::Result<::core::option::Option<&mut #target>, ::strata_orm::Error> {
                    ::strata_orm::Entity::record_mut(self).has_one::<#target>(ctx, #name).await
                }
            },
            Kind::BelongsTo => quote! {
                #[doc = #doc]
                pub async fn #method(
                    &mut self,
                    ctx: &::strata_orm::Context,
                ) -> ::core::result::Result<::core::option::Option<&mut #target>, ::strata_orm::Error> {
                    ::strata_orm::Entity::record_mut(self).belongs_to::<#target>(ctx, #name).await
                }
            },
            Kind::HasMany => quote! {
                #[doc = #doc]
                pub fn #method(
                    &mut self,
                    ctx: &::strata_orm::Context,
                ) -> ::core::result::Result<&mut ::strata_orm::RecordCollection<#target>, ::strata_orm::Error> {
                    ::strata_orm::Entity::record_mut(self).has_many::<#target>(ctx, #name)
                }
            },
            Kind::ManyToMany => quote! {
                #[doc = #doc]
                pub fn #method(
                    &mut self,
                    ctx: &::strata_orm::Context,
                ) -> ::core::result::Result<
                    ::core::option::Option<&mut ::strata_orm::RecordCollection<#target>>,
                    ::strata_orm::Error,
                > {
                    ::strata_orm::Entity::record_mut(self).has_and_belongs_to_many::<#target>(ctx, #name)
                }
            },
        }
    });

    let lifecycle = (!attrs.custom_hooks).then(|| {
        quote! {
            impl #impl_generics ::strata_orm::Lifecycle for #struct_name #ty_generics #where_clause {}
        }
    });

    Ok(quote! {
        impl #impl_generics ::strata_orm::Entity for #struct_name #ty_generics #where_clause {
            const NAME: &'static str = #entity_name;

            fn declare() -> ::strata_orm::EntityDeclaration {
                ::strata_orm::EntityDeclaration::new(#entity_name)
                    #table
                    #(#associations)*
                    #(#partitions)*
                    #(#serialized)*
            }

            fn from_record(record: ::strata_orm::Record) -> Self {
                #constructor
            }

            fn record(&self) -> &::strata_orm::Record {
                &self.#record_member
            }

            fn record_mut(&mut self) -> &mut ::strata_orm::Record {
                &mut self.#record_member
            }

            fn into_record(self) -> ::strata_orm::Record {
                self.#record_member
            }
        }

        impl #impl_generics #struct_name #ty_generics #where_clause {
            #(#accessors)*
        }

        #lifecycle
    })
}
