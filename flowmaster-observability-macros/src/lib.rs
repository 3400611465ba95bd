//! `#[obs]` attaches a `tracing::instrument` span to a function when the
//! consuming crate is built with the `observability` feature.

use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Without arguments the span is named after the function, recorded at debug
/// level, and skips every argument. Arguments are forwarded to
/// `tracing::instrument` verbatim.
#[proc_macro_attribute]
pub fn obs(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item = parse_macro_input!(input as ItemFn);
    let op = item.sig.ident.to_string();
    let attr = if args.is_empty() {
        syn::parse_quote!(
            #[cfg_attr(
                feature = "observability",
                tracing::instrument(level = "debug", skip_all, fields(op = #op))
            )]
        )
    } else {
        let args = proc_macro2::TokenStream::from(args);
        syn::parse_quote!(#[cfg_attr(feature = "observability", tracing::instrument(#args))])
    };
    item.attrs.push(attr);
    TokenStream::from(quote!(#item))
}
