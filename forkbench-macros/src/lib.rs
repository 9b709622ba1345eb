//! forkbench Macros
//!
//! `#[forkbench::bench]` turns a plain function whose arguments are
//! fixture references into a registered benchmark:
//!
//! - a wrapper that borrows each fixture from the running invocation,
//!   calls the function and sinks its return value into the blackhole
//! - an `inventory` submission of the `BenchmarkDef`

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{FnArg, ItemFn, ReturnType, Type, parse_macro_input};

mod attr {
    use syn::meta::ParseNestedMeta;

    /// Get the attribute name as a string
    pub fn name(meta: &ParseNestedMeta) -> String {
        meta.path
            .get_ident()
            .map(|i| i.to_string())
            .unwrap_or_default()
    }

    /// Parse a string literal attribute: `attr = "value"`
    pub fn string(meta: &ParseNestedMeta) -> syn::Result<String> {
        let value: syn::LitStr = meta.value()?.parse()?;
        Ok(value.value())
    }

    /// Parse an integer literal attribute: `attr = 42`
    pub fn int<T>(meta: &ParseNestedMeta) -> syn::Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let value: syn::LitInt = meta.value()?.parse()?;
        value.base10_parse()
    }

    /// Parse a bracketed array of strings: `items = ["a", "b", "c"]`
    pub fn string_array(meta: &ParseNestedMeta) -> syn::Result<Vec<String>> {
        meta.value()?;
        let content;
        syn::bracketed!(content in meta.input);
        let items: syn::punctuated::Punctuated<syn::LitStr, syn::Token![,]> =
            syn::punctuated::Punctuated::parse_terminated(&content)?;
        Ok(items.iter().map(|s| s.value()).collect())
    }

    /// Create an unknown attribute error
    pub fn unknown(meta: &ParseNestedMeta, name: &str) -> syn::Error {
        meta.error(format!("unknown attribute: {}", name))
    }
}

/// Register a benchmark function
///
/// # Example
///
/// ```ignore
/// #[forkbench::bench]
/// fn sum_table(table: &Table) -> u64 {
///     table.rows.iter().sum()
/// }
///
/// // With configuration
/// #[forkbench::bench(
///     id = "lz4_compress",
///     group = "codec",
///     mode = "avgt",
///     unit = "ms",
///     warmup = 5,
///     iterations = 5,
///     forks = 1,
///     blackhole = 8,
///     params = ["byte.size=1048576,4194304"]
/// )]
/// fn compress(input: &Input, block: &Block) -> Result<usize, CodecError> { ... }
/// ```
///
/// Every argument must be `&T` with `T: forkbench::Fixture`. A non-unit
/// return value is consumed by the blackhole; an `Err` from a `Result`
/// return fails the fork.
#[proc_macro_attribute]
pub fn bench(args: TokenStream, item: TokenStream) -> TokenStream {
    let args = TokenStream2::from(args);
    let func = parse_macro_input!(item as ItemFn);

    bench_impl(args, func)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}

fn bench_impl(args: TokenStream2, func: ItemFn) -> Result<TokenStream2, syn::Error> {
    let fixtures = validate_signature(&func)?;
    let config = parse_bench_config(args)?;

    let fn_name = &func.sig.ident;
    let fn_name_str = fn_name.to_string();
    let wrapper_name = format_ident!("__forkbench_wrapper_{}", fn_name);
    let fixtures_name = format_ident!("__FORKBENCH_FIXTURES_{}", fn_name);
    let params_name = format_ident!("__FORKBENCH_PARAMS_{}", fn_name);

    let bindings: Vec<_> = (0..fixtures.len())
        .map(|i| format_ident!("__fixture{}", i))
        .collect();
    let call = quote! { #fn_name(#(#bindings),*) };
    let invoke = match return_kind(&func.sig.output) {
        ReturnKind::Unit => quote! {
            #call;
            ::core::result::Result::Ok(())
        },
        ReturnKind::Result => quote! {
            match #call {
                ::core::result::Result::Ok(value) => {
                    bh.consume(value);
                    ::core::result::Result::Ok(())
                }
                ::core::result::Result::Err(err) => {
                    ::core::result::Result::Err(::forkbench::InvocationError::new(err))
                }
            }
        },
        ReturnKind::Value => quote! {
            bh.consume(#call);
            ::core::result::Result::Ok(())
        },
    };

    let id = config.id.unwrap_or_else(|| fn_name_str.clone());
    let group = config.group.unwrap_or_else(|| "default".to_string());
    let mode = config.mode;
    let unit = config.unit;
    let axes = config.params.iter().map(|(name, values)| {
        quote! {
            ::forkbench::ParamDef { name: #name, values: &[#(#values),*] }
        }
    });
    let warmup = option_tokens(config.warmup);
    let iterations = option_tokens(config.iterations);
    let forks = option_tokens(config.forks);
    let threads = option_tokens(config.threads);
    let batch = option_tokens(config.batch);
    let blackhole = option_tokens(config.blackhole);

    Ok(quote! {
        #func

        #[doc(hidden)]
        #[allow(non_upper_case_globals)]
        const #fixtures_name: &[::forkbench::FixtureDef] =
            &[#(::forkbench::FixtureDef::of::<#fixtures>()),*];

        #[doc(hidden)]
        #[allow(non_upper_case_globals)]
        const #params_name: &[::forkbench::ParamDef] = &[#(#axes),*];

        #[doc(hidden)]
        #[allow(non_snake_case, unused_variables)]
        fn #wrapper_name(
            inv: &::forkbench::Invocation<'_>,
            bh: &mut ::forkbench::Blackhole,
        ) -> ::core::result::Result<(), ::forkbench::InvocationError> {
            #(let #bindings = inv.fixture::<#fixtures>()?;)*
            #invoke
        }

        ::forkbench::internal::inventory::submit! {
            ::forkbench::BenchmarkDef {
                id: #id,
                name: #fn_name_str,
                group: #group,
                mode: #mode,
                time_unit: #unit,
                fixtures: #fixtures_name,
                params: #params_name,
                warmup_iterations: #warmup,
                measurement_iterations: #iterations,
                forks: #forks,
                threads: #threads,
                batch_size: #batch,
                blackhole_tokens: #blackhole,
                runner_fn: #wrapper_name,
                file: file!(),
                line: line!(),
                module_path: module_path!(),
            }
        }
    })
}

enum ReturnKind {
    Unit,
    Result,
    Value,
}

fn return_kind(output: &ReturnType) -> ReturnKind {
    match output {
        ReturnType::Default => ReturnKind::Unit,
        ReturnType::Type(_, ty) => match ty.as_ref() {
            Type::Tuple(tuple) if tuple.elems.is_empty() => ReturnKind::Unit,
            Type::Path(path)
                if path
                    .path
                    .segments
                    .last()
                    .is_some_and(|segment| segment.ident == "Result") =>
            {
                ReturnKind::Result
            }
            _ => ReturnKind::Value,
        },
    }
}

fn option_tokens<T: quote::ToTokens>(value: Option<T>) -> TokenStream2 {
    match value {
        Some(v) => quote! { ::core::option::Option::Some(#v) },
        None => quote! { ::core::option::Option::None },
    }
}

struct BenchConfig {
    id: Option<String>,
    group: Option<String>,
    mode: TokenStream2,
    unit: TokenStream2,
    warmup: Option<u32>,
    iterations: Option<u32>,
    forks: Option<u32>,
    threads: Option<u32>,
    batch: Option<u64>,
    blackhole: Option<u64>,
    params: Vec<(String, Vec<String>)>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            id: None,
            group: None,
            mode: quote! { ::forkbench::Mode::AverageTime },
            unit: quote! { ::forkbench::TimeUnit::Nanoseconds },
            warmup: None,
            iterations: None,
            forks: None,
            threads: None,
            batch: None,
            blackhole: None,
            params: Vec::new(),
        }
    }
}

fn parse_bench_config(args: TokenStream2) -> Result<BenchConfig, syn::Error> {
    let mut config = BenchConfig::default();

    if args.is_empty() {
        return Ok(config);
    }

    let parser = syn::meta::parser(|meta| {
        let name = attr::name(&meta);
        match name.as_str() {
            "id" => config.id = Some(attr::string(&meta)?),
            "group" => config.group = Some(attr::string(&meta)?),
            "mode" => {
                let value = attr::string(&meta)?;
                config.mode = mode_tokens(&value).ok_or_else(|| {
                    meta.error(format!("unknown mode `{value}` (expected \"avgt\" or \"thrpt\")"))
                })?;
            }
            "unit" => {
                let value = attr::string(&meta)?;
                config.unit = unit_tokens(&value).ok_or_else(|| {
                    meta.error(format!(
                        "unknown unit `{value}` (expected \"ns\", \"us\", \"ms\", \"s\" or \"m\")"
                    ))
                })?;
            }
            "warmup" => config.warmup = Some(attr::int(&meta)?),
            "iterations" => {
                let value: u32 = attr::int(&meta)?;
                if value == 0 {
                    return Err(meta.error("iterations must be at least 1"));
                }
                config.iterations = Some(value);
            }
            "forks" => config.forks = Some(attr::int(&meta)?),
            "threads" => {
                let value: u32 = attr::int(&meta)?;
                if value == 0 {
                    return Err(meta.error("threads must be at least 1"));
                }
                config.threads = Some(value);
            }
            "batch" => {
                let value: u64 = attr::int(&meta)?;
                if value == 0 {
                    return Err(meta.error("batch must be at least 1"));
                }
                config.batch = Some(value);
            }
            "blackhole" => config.blackhole = Some(attr::int(&meta)?),
            "params" => {
                for axis in attr::string_array(&meta)? {
                    let parsed = parse_param_axis(&axis).map_err(|e| meta.error(e))?;
                    config.params.push(parsed);
                }
            }
            _ => return Err(attr::unknown(&meta, &name)),
        }
        Ok(())
    });

    syn::parse::Parser::parse2(parser, args)?;

    Ok(config)
}

fn mode_tokens(value: &str) -> Option<TokenStream2> {
    match value {
        "avgt" | "average_time" => Some(quote! { ::forkbench::Mode::AverageTime }),
        "thrpt" | "throughput" => Some(quote! { ::forkbench::Mode::Throughput }),
        _ => None,
    }
}

fn unit_tokens(value: &str) -> Option<TokenStream2> {
    match value {
        "ns" => Some(quote! { ::forkbench::TimeUnit::Nanoseconds }),
        "us" => Some(quote! { ::forkbench::TimeUnit::Microseconds }),
        "ms" => Some(quote! { ::forkbench::TimeUnit::Milliseconds }),
        "s" => Some(quote! { ::forkbench::TimeUnit::Seconds }),
        "m" | "min" => Some(quote! { ::forkbench::TimeUnit::Minutes }),
        _ => None,
    }
}

/// `"name=v1,v2"` → `("name", ["v1", "v2"])`
fn parse_param_axis(axis: &str) -> Result<(String, Vec<String>), String> {
    let (name, values) = axis
        .split_once('=')
        .ok_or_else(|| format!("parameter `{axis}` must look like \"name=v1,v2\""))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("parameter `{axis}` has an empty name"));
    }
    let values: Vec<String> = values
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return Err(format!("parameter `{name}` declares no values"));
    }
    Ok((name.to_string(), values))
}

/// Fixture types of the arguments, in order
fn validate_signature(func: &ItemFn) -> syn::Result<Vec<Type>> {
    if func.sig.asyncness.is_some() {
        return Err(syn::Error::new_spanned(
            func.sig.asyncness,
            "forkbench: benchmark functions cannot be async",
        ));
    }
    if !func.sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &func.sig.generics,
            "forkbench: benchmark functions cannot be generic",
        ));
    }

    func.sig
        .inputs
        .iter()
        .map(|input| match input {
            FnArg::Typed(pat) => match pat.ty.as_ref() {
                Type::Reference(r) if r.mutability.is_none() => Ok((*r.elem).clone()),
                other => Err(syn::Error::new_spanned(
                    other,
                    "forkbench: benchmark arguments must be shared fixture references (`&T`)",
                )),
            },
            FnArg::Receiver(receiver) => Err(syn::Error::new_spanned(
                receiver,
                "forkbench: benchmark functions cannot take `self`",
            )),
        })
        .collect()
}
