use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{ExprPath, Fields, ItemStruct, LitStr, Type, parse_macro_input};

extern crate proc_macro;

/// Turns a plain struct into reusable ammo.
///
/// Derives `Debug`, `Default`, `Clone` and the serde traits, then implements
/// `volley::Ammo`. When the struct has a named `id: u64` field the provider
/// assigned id is stored there; otherwise ids are ignored.
///
/// `reset = "path"` names a `fn(&mut Self)` used as `Ammo::reset`, for ammo
/// that keeps its buffers between shots.
///
/// ```rust, ignore
/// use volley::macros::ammo;
///
/// #[ammo(reset = "Request::clear")]
/// #[serde(default)]
/// struct Request {
///     id: u64,
///     path: String,
/// }
///
/// impl Request {
///     fn clear(&mut self) {
///         self.id = 0;
///         self.path.clear();
///     }
/// }
/// ```
#[proc_macro_attribute]
pub fn ammo(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut reset: Option<ExprPath> = None;
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("reset") {
            let lit: LitStr = meta.value()?.parse()?;
            reset = Some(lit.parse()?);
            Ok(())
        } else {
            Err(meta.error("unsupported ammo attribute"))
        }
    });
    parse_macro_input!(attr with parser);

    let ast = parse_macro_input!(item as ItemStruct);
    let ident = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
    let id_methods = id_methods(&ast);
    let reset_method = reset.map(|path| {
        quote! {
            fn reset(&mut self) {
                #path(self)
            }
        }
    });

    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::fmt::Debug,
            std::default::Default,
            std::clone::Clone
        )]
        #ast

        impl #impl_generics ::volley::Ammo for #ident #ty_generics #where_clause {
            #id_methods
            #reset_method
        }
    };

    TokenStream::from(expanded)
}

fn id_methods(ast: &ItemStruct) -> TokenStream2 {
    let Fields::Named(fields) = &ast.fields else {
        return TokenStream2::new();
    };
    let has_id = fields.named.iter().any(|field| {
        field.ident.as_ref().is_some_and(|ident| ident == "id")
            && matches!(&field.ty, Type::Path(path) if path.path.is_ident("u64"))
    });
    if !has_id {
        return TokenStream2::new();
    }

    quote! {
        fn id(&self) -> u64 {
            self.id
        }

        fn set_id(&mut self, id: u64) {
            self.id = id;
        }
    }
}
