use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Arguments accepted by both attributes: an optional timeout in seconds and,
/// for async tests, the `paused` flag.
///
/// `#[tokio_timeout_test]`, `#[tokio_timeout_test(10)]`,
/// `#[tokio_timeout_test(10, paused)]`, `#[tokio_timeout_test(paused)]`.
struct TimeoutArgs {
    secs: u64,
    paused: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };

        while !input.is_empty() {
            if input.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                args.secs = secs;
            } else {
                let ident: Ident = input.parse()?;
                if ident != "paused" {
                    return Err(syn::Error::new_spanned(
                        ident,
                        "expected a timeout in seconds or `paused`",
                    ));
                }
                args.paused = true;
            }

            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(args)
    }
}

/// Runs an async test on a fresh current-thread runtime under a wall-clock
/// watchdog. With `paused` the Tokio clock starts paused, so timers resolve
/// instantly and elapsed virtual time can be asserted exactly.
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

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = args.secs;
    let builder = if args.paused {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
        }
    } else {
        quote! {
            tokio::runtime::Builder::new_current_thread().enable_all()
        }
    };
    // A paused clock auto-advances through any in-test timeout, so only the
    // real-time watchdog below guards paused tests.
    let body = if args.paused {
        quote! { runtime.block_on(async move #block); }
    } else {
        quote! {
            runtime.block_on(async {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .build()
                        .expect("failed to build Tokio runtime");
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

/// Synchronous counterpart of [`tokio_timeout_test`]; `paused` is rejected.
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
        return syn::Error::new_spanned(
            &sig.ident,
            "`paused` only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let timeout = args.secs;

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #block ));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
