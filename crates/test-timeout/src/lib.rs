//! `#[tokio_timeout_test]`: an async test that fails instead of hanging.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(secs = 20, multi_thread)]
//! async fn agent_round_trip() { /* ... */ }
//! ```
//!
//! Arguments, all optional and comma separated: a bare integer or `secs = N` (default 60),
//! `multi_thread` for a two-worker runtime instead of current-thread, and `start_paused`
//! to start with the tokio clock paused.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input,
    punctuated::Punctuated,
    Attribute, Ident, ItemFn, LitInt, Token,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

enum Arg {
    Secs(LitInt),
    Flag(Ident),
}

impl Parse for Arg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return Ok(Arg::Secs(input.parse()?));
        }
        let ident: Ident = input.parse()?;
        if input.peek(Token![=]) {
            input.parse::<Token![=]>()?;
            if ident != "secs" {
                return Err(syn::Error::new(ident.span(), "expected `secs = N`"));
            }
            return Ok(Arg::Secs(input.parse()?));
        }
        Ok(Arg::Flag(ident))
    }
}

struct Options {
    secs: u64,
    multi_thread: bool,
    start_paused: bool,
}

impl Parse for Options {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut options = Options {
            secs: DEFAULT_TIMEOUT_SECS,
            multi_thread: false,
            start_paused: false,
        };
        for arg in Punctuated::<Arg, Token![,]>::parse_terminated(input)? {
            match arg {
                Arg::Secs(lit) => {
                    options.secs = lit.base10_parse()?;
                    if options.secs == 0 {
                        return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
                    }
                }
                Arg::Flag(flag) if flag == "multi_thread" => options.multi_thread = true,
                Arg::Flag(flag) if flag == "start_paused" => options.start_paused = true,
                Arg::Flag(flag) => {
                    return Err(syn::Error::new(
                        flag.span(),
                        "expected `secs = N`, `multi_thread` or `start_paused`",
                    ))
                }
            }
        }
        Ok(options)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = parse_macro_input!(attr as Options);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    if options.multi_thread && options.start_paused {
        return syn::Error::new(
            Span::call_site(),
            "start_paused requires the current-thread runtime",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let secs = options.secs;
    let builder = if options.multi_thread {
        quote! { tokio::runtime::Builder::new_multi_thread().worker_threads(2) }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread() }
    };
    let paused = if options.start_paused {
        quote! { .start_paused(true) }
    } else {
        quote! {}
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .enable_all()
                        #paused
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async move #block);
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(limit) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {}s", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

/// Drops `#[test]` and `#[tokio::test]` so the generated `#[test]` is the only one.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments == ["test"] || segments == ["tokio", "test"]
}
