//! Call command handler

use super::{load_declarations, parse_argument};
use crate::cli::CallArgs;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::logging::timing::Timer;
use crate::output::{value_to_json, OutputWriter};
use cmarshal_core::declarations::LibraryDecl;
use cmarshal_core::{
    BoundFunction, CallingConvention, FunctionSignature, LayoutRegistry, LoadFlags, NativeType,
    Value,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct CallReport {
    function: String,
    signature: String,
    result: serde_json::Value,
    /// By-reference arguments as read back after the call
    #[serde(skip_serializing_if = "Vec::is_empty")]
    updated: Vec<UpdatedArgument>,
    duration_us: u64,
}

#[derive(Debug, Serialize)]
struct UpdatedArgument {
    index: usize,
    value: serde_json::Value,
}

/// Handle the call command
pub async fn handle_call(args: CallArgs, config: &Config, output: &mut OutputWriter) -> Result<()> {
    let search_dirs = config.search_dirs(&[]);
    let declarations = match args.declarations.clone().or_else(|| config.declarations.clone()) {
        Some(path) => Some(load_declarations(&path)?),
        None => None,
    };
    let registry = match &declarations {
        Some(d) => d.build_registry()?,
        None => LayoutRegistry::new(),
    };

    let explicit = args.returns.is_some() || !args.params.is_empty() || args.variadic.is_some();
    let declared = declarations.as_ref().filter(|_| !explicit).and_then(|d| {
        d.libraries.iter().find_map(|library| {
            library
                .functions
                .iter()
                .find(|(name, _)| *name == args.symbol)
                .map(|(_, decl)| (library, decl))
        })
    });

    let (function, background) = match declared {
        Some((library, decl)) => {
            tracing::debug!(symbol = %args.symbol, library = %library.label(), "using declared signature");
            let handle = library.open(&search_dirs)?;
            let function = BoundFunction::bind(&handle, &args.symbol, decl.signature(&registry)?)?;
            (function, decl.background || args.background)
        }
        None => {
            let signature = explicit_signature(&args, &registry)?;
            let library = LibraryDecl {
                name: None,
                path: args.library.clone(),
                flags: parse_flags(args.flags.as_deref())?,
                functions: Default::default(),
            };
            let handle = library.open(&search_dirs)?;
            (BoundFunction::bind(&handle, &args.symbol, signature)?, args.background)
        }
    };

    let signature = function.signature().clone();
    if args.args.len() != signature.arity() {
        return Err(Error::invalid_args(format!(
            "{} takes {} argument(s), {} given",
            function,
            signature.arity(),
            args.args.len()
        )));
    }
    let values = args
        .args
        .iter()
        .zip(signature.params())
        .enumerate()
        .map(|(i, (literal, param))| parse_argument(literal, param, i))
        .collect::<Result<Vec<Value>>>()?;

    output.info(&format!("Calling {}", function))?;

    let timer = Timer::with_details("native_call", function.name());
    // SAFETY: the caller vouches that the declared signature matches the
    // native definition; cmarshal cannot verify that.
    let (result, after) = if background {
        let worker = function.clone().into_worker()?;
        let outcome = unsafe { worker.call(values).await }?;
        (outcome.value, outcome.args)
    } else {
        let mut values = values;
        let result = unsafe { function.call(&mut values) }?;
        (result, values)
    };
    let duration_us = timer.elapsed().as_micros() as u64;
    drop(timer);

    let updated: Vec<UpdatedArgument> = signature
        .params()
        .iter()
        .zip(&after)
        .enumerate()
        .filter(|(_, (param, value))| {
            matches!(param, NativeType::ByRef(_)) && matches!(value, Value::Record(_))
        })
        .map(|(index, (_, value))| UpdatedArgument {
            index,
            value: value_to_json(value),
        })
        .collect();

    if !output.is_human() {
        return output.data(&CallReport {
            function: function.name().to_string(),
            signature: signature.to_string(),
            result: value_to_json(&result),
            updated,
            duration_us,
        });
    }

    output.writeln(&result.to_string())?;
    for arg in &updated {
        output.info(&format!("argument {} after call: {}", arg.index, after[arg.index]))?;
    }
    Ok(())
}

/// Signature from `--returns`, `--param` and `--variadic`
fn explicit_signature(args: &CallArgs, registry: &LayoutRegistry) -> Result<FunctionSignature> {
    let returns = args.returns.as_deref().unwrap_or("void");
    let signature = FunctionSignature::parse(registry, returns, &args.params)?;
    match args.variadic {
        Some(fixed) => Ok(signature.with_convention(CallingConvention::Variadic { fixed })?),
        None => Ok(signature),
    }
}

/// Parse `--flags` with the same text syntax as declarations files
fn parse_flags(flags: Option<&str>) -> Result<LoadFlags> {
    match flags {
        Some(text) => serde_json::from_value(serde_json::Value::String(text.to_string()))
            .map_err(|e| Error::invalid_args(format!("invalid load flags '{}': {}", text, e))),
        None => Ok(LoadFlags::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::OutputFormat;
    use crate::output::tests::writer;

    fn call_args(symbol: &str, returns: &str, params: &[&str], args: &[&str]) -> CallArgs {
        CallArgs {
            symbol: symbol.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            library: None,
            returns: Some(returns.to_string()),
            params: params.iter().map(|s| s.to_string()).collect(),
            variadic: None,
            flags: None,
            declarations: None,
            background: false,
        }
    }

    #[test]
    fn test_parse_flags() {
        assert_eq!(
            parse_flags(Some("RESOLVE_LAZY | SCOPE_GLOBAL")).unwrap(),
            LoadFlags::RESOLVE_LAZY | LoadFlags::SCOPE_GLOBAL
        );
        assert_eq!(parse_flags(None).unwrap(), LoadFlags::default());
        assert!(parse_flags(Some("RESOLVE_SOMETIMES")).is_err());
    }

    #[test]
    fn test_variadic_signature() {
        let mut args = call_args("printf", "int32", &["string", "int32"], &[]);
        args.variadic = Some(1);
        let signature = explicit_signature(&args, &LayoutRegistry::new()).unwrap();
        assert_eq!(signature.convention(), CallingConvention::Variadic { fixed: 1 });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_call_atoi_json() {
        let (mut out, buffer) = writer(OutputFormat::Json);
        let args = call_args("atoi", "int32", &["string"], &["-42"]);
        handle_call(args, &Config::default(), &mut out).await.unwrap();

        let json: serde_json::Value = serde_json::from_str(&buffer.contents()).unwrap();
        assert_eq!(json["result"], -42);
        assert_eq!(json["signature"], "(string) -> int32");
        assert!(json.get("updated").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_call_on_worker() {
        let (mut out, buffer) = writer(OutputFormat::Human);
        let mut args = call_args("strlen", "size_t", &["string"], &["rosie"]);
        args.background = true;
        handle_call(args, &Config::default(), &mut out).await.unwrap();
        assert!(buffer.contents().lines().any(|l| l == "5"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wrong_literal_count() {
        let (mut out, _) = writer(OutputFormat::Human);
        let args = call_args("atoi", "int32", &["string"], &[]);
        let err = handle_call(args, &Config::default(), &mut out).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgs(_)));
    }
}
