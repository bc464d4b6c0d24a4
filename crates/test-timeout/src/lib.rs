use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_SECS: u64 = 30;

/// Arguments: an optional deadline in seconds, then optionally
/// `multi_thread` to run on a multi-threaded runtime.
///
/// ```ignore
/// #[test_timeout::tokio_timeout_test(20, multi_thread)]
/// async fn negotiates() { /* ... */ }
/// ```
struct TimeoutArgs {
    secs: u64,
    multi_thread: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_SECS,
            multi_thread: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                args.secs = lit.base10_parse()?;
                if args.secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "deadline must be positive"));
                }
            } else {
                let flavor: Ident = input.parse()?;
                match flavor.to_string().as_str() {
                    "multi_thread" => args.multi_thread = true,
                    "current_thread" => args.multi_thread = false,
                    _ => {
                        return Err(syn::Error::new_spanned(
                            flavor,
                            "expected `multi_thread` or `current_thread`",
                        ));
                    }
                }
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(args)
    }
}

/// Runs an async test on its own runtime in a watchdog thread and fails it
/// once the deadline passes, even when the test body never yields.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TimeoutArgs { secs, multi_thread } = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.ident, "expected an async fn")
            .to_compile_error()
            .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test(attr))
        .collect();
    let name = sig.ident.to_string();
    let runtime = if multi_thread {
        quote! { tokio::runtime::Builder::new_multi_thread().worker_threads(2) }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread() }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            let worker = std::thread::Builder::new()
                .name(format!("{}-runtime", #name))
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = #runtime
                            .enable_all()
                            .build()
                            .expect("build test runtime");
                        runtime.block_on(async move #block)
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("spawn test runtime thread");
            match done_rx.recv_timeout(deadline) {
                Ok(Ok(())) => {
                    let _ = worker.join();
                }
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} exceeded {}s", #name, #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} runtime thread exited without a result", #name)
                }
            }
        }
    })
}

fn is_tokio_test(attr: &Attribute) -> bool {
    let path = attr.path();
    path.segments.len() == 2
        && path.segments[0].ident == "tokio"
        && path.segments[1].ident == "test"
}
