//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` an async one
//! on a current-thread runtime. Both take an optional limit in seconds
//! (default 60). The async form also accepts `paused`, which starts the
//! runtime with a paused clock; the consuming crate then needs tokio's
//! `test-util` feature.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(5, paused)]
//! async fn waits_out_the_deadline() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input,
    punctuated::Punctuated,
    Attribute, Ident, ItemFn, LitInt, Token,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TimeoutArgs {
    secs: u64,
    paused: bool,
}

enum TimeoutArg {
    Secs(LitInt),
    Flag(Ident),
}

impl Parse for TimeoutArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            input.parse().map(TimeoutArg::Secs)
        } else {
            input.parse().map(TimeoutArg::Flag)
        }
    }
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        for arg in Punctuated::<TimeoutArg, Token![,]>::parse_terminated(input)? {
            match arg {
                TimeoutArg::Secs(lit) => {
                    args.secs = lit.base10_parse()?;
                    if args.secs == 0 {
                        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                    }
                }
                TimeoutArg::Flag(flag) if flag == "paused" => args.paused = true,
                TimeoutArg::Flag(flag) => {
                    return Err(syn::Error::new_spanned(flag, "expected a number of seconds or `paused`"));
                }
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
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
    sig.asyncness = None;

    let attrs = strip(attrs, &["tokio", "test"]);
    let secs = args.secs;
    let pause = args.paused.then(|| quote! { .start_paused(true) });
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            #pause
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                .await
                .expect("test timed out");
        });
    };
    let guarded = guard(secs, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }
    if args.paused {
        return syn::Error::new_spanned(&sig.ident, "`paused` only applies to tokio_timeout_test")
            .to_compile_error()
            .into();
    }

    let attrs = strip(attrs, &["test"]);
    let guarded = guard(args.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    })
}

/// Run `body` on its own thread and fail once `secs` of wall time pass
/// without a result. Panics from the body are re-raised on the test thread.
fn guard(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(std::time::Duration::from_secs(#secs)) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

/// Drop attributes whose path is exactly `path`, so `#[test]` or
/// `#[tokio::test]` are not applied twice.
fn strip(attrs: Vec<Attribute>, path: &[&str]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            segments != path
        })
        .collect()
}
