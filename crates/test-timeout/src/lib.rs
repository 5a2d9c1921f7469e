//! `#[tokio_timeout_test]`: an async test on its own current-thread Tokio
//! runtime, bounded by a hard wall-clock timeout, with a test-writer tracing
//! subscriber filtered by `RUST_LOG`.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn finishes_quickly() { /* ... */ }
//!
//! #[test_timeout::tokio_timeout_test(5)]
//! async fn finishes_in_five_seconds() { /* ... */ }
//! ```
//!
//! The expansion names `::tokio` and `::tracing_subscriber` by absolute path,
//! so the crate using the attribute must list both as (dev-)dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! tokio = { version = "1", features = ["rt", "time"] }
//! tracing-subscriber = { version = "0.3", features = ["fmt", "env-filter"] }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 20;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let function = parse_macro_input!(item as ItemFn);
    match expand(function, timeout_secs) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn expand(function: ItemFn, timeout_secs: u64) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    if sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        ));
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let test_name = sig.ident.to_string();

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = ::std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = ::std::sync::mpsc::channel();
            ::std::thread::Builder::new()
                .name(::std::string::String::from(#test_name))
                .spawn(move || {
                    let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                        let _ = ::tracing_subscriber::fmt()
                            .with_test_writer()
                            .with_env_filter(::tracing_subscriber::EnvFilter::from_default_env())
                            .try_init();
                        let runtime = ::tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .expect("failed to build Tokio runtime");
                        runtime.block_on(async {
                            ::tokio::time::timeout(timeout_duration, async move #block)
                                .await
                                .expect("test timed out");
                        });
                    }));
                    let _ = sender.send(result);
                })
                .expect("failed to spawn test thread");
            match receiver.recv_timeout(timeout_duration + ::std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} timed out after {:?}", #test_name, timeout_duration)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} failed before reporting a result", #test_name)
                }
            }
        }
    })
}

/// Matches `#[test]`, `#[tokio::test]` and their attribute-argument forms.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
