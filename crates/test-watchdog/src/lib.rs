//! `#[watchdog]` test attribute.
//!
//! Runs the annotated test on a guard thread and fails it once the deadline
//! passes, so a wait that never resolves reports instead of hanging the run.
//! Works on both `fn` and `async fn` tests; async bodies get their own
//! multi-thread Tokio runtime.
//!
//! ```ignore
//! #[test_watchdog::watchdog(secs = 5)]
//! fn ack_wait_is_bounded() { /* ... */ }
//!
//! #[test_watchdog::watchdog(secs = 10, trace)]
//! async fn signaling_round_trip() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_DEADLINE_SECS: u64 = 30;

struct WatchdogArgs {
    secs: u64,
    trace: bool,
}

#[proc_macro_attribute]
pub fn watchdog(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = WatchdogArgs {
        secs: DEFAULT_DEADLINE_SECS,
        trace: false,
    };
    let arg_parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            args.secs = lit.base10_parse()?;
            if args.secs == 0 {
                return Err(meta.error("watchdog deadline must be greater than zero"));
            }
            Ok(())
        } else if meta.path.is_ident("trace") {
            args.trace = true;
            Ok(())
        } else {
            Err(meta.error("expected `secs = N` or `trace`"))
        }
    });
    parse_macro_input!(attr with arg_parser);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let run_body: TokenStream2 = if sig.asyncness.take().is_some() {
        quote! {
            let runtime = ::tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .expect("watchdog runtime");
            runtime.block_on(async move #block)
        }
    } else {
        quote! { #block }
    };

    let subscriber: TokenStream2 = if args.trace {
        quote! {
            let _ = ::tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(
                    ::tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| ::tracing_subscriber::EnvFilter::new("debug")),
                )
                .try_init();
        }
    } else {
        TokenStream2::new()
    };

    let name = sig.ident.to_string();
    let secs = args.secs;

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #subscriber
            let deadline = ::std::time::Duration::from_secs(#secs);
            let (report, outcome) = ::std::sync::mpsc::channel();
            let guard = ::std::thread::Builder::new()
                .name(format!("watchdog-{}", #name))
                .spawn(move || {
                    let result = ::std::panic::catch_unwind(
                        ::std::panic::AssertUnwindSafe(|| { #run_body }),
                    );
                    let _ = report.send(result);
                })
                .expect("spawn watchdog guard thread");
            match outcome.recv_timeout(deadline) {
                Ok(Ok(value)) => {
                    let _ = guard.join();
                    value
                }
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} exceeded its {}s watchdog", #name, #secs)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} guard thread exited without reporting", #name)
                }
            }
        }
    })
}

fn is_test_marker(attr: &Attribute) -> bool {
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
