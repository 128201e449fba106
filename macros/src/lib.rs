//! Augment the development of primitives with procedural macros.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Error, ItemFn, LitStr};

/// Run a test function with a `tracing` subscriber that captures output at the given
/// level (defaults to `DEBUG`).
///
/// The generated test requires `tracing` and `tracing-subscriber` to be available to the
/// crate under test (usually as dev-dependencies).
///
/// # Example
/// ```rust,ignore
/// use halcyon_macros::test_traced;
/// use tracing::{debug, info};
///
/// #[test_traced("INFO")]
/// fn test_info_level() {
///     info!("shown");
///     debug!("hidden");
/// }
/// ```
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    // Parse the level (if provided)
    let level = if attr.is_empty() {
        "DEBUG".to_string()
    } else {
        parse_macro_input!(attr as LitStr).value()
    };
    let level = match level.to_uppercase().as_str() {
        "TRACE" => quote! { ::tracing::Level::TRACE },
        "DEBUG" => quote! { ::tracing::Level::DEBUG },
        "INFO" => quote! { ::tracing::Level::INFO },
        "WARN" => quote! { ::tracing::Level::WARN },
        "ERROR" => quote! { ::tracing::Level::ERROR },
        _ => {
            return Error::new(
                Span::call_site(),
                "invalid level: expected TRACE, DEBUG, INFO, WARN, or ERROR",
            )
            .to_compile_error()
            .into();
        }
    };

    let name = &input.sig.ident;
    let attrs = &input.attrs;
    let vis = &input.vis;
    let block = &input.block;
    let output = &input.sig.output;

    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis fn #name() #output {
            // Create a subscriber that writes through the test harness
            let subscriber = ::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(#level)
                .with_line_number(true)
                .finish();
            let dispatcher = ::tracing::Dispatch::new(subscriber);

            // Run the test with the subscriber installed for this thread only
            ::tracing::dispatcher::with_default(&dispatcher, || #block)
        }
    };
    TokenStream::from(expanded)
}
