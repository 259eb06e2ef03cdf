//! Smoke command handler
//!
//! A fixed sequence of calls with known answers: `ceil` from the math
//! library, `atoi` and `gettimeofday` from the running process, and, when
//! the reference test library is available, the struct-marshaling entry
//! points (by value, by reference, struct returns, pointer arrays).

use crate::cli::SmokeArgs;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::logging::timing::Timer;
use crate::output::OutputWriter;
use cmarshal_core::{
    BoundFunction, Declarations, FunctionSignature, FunctionTable, LayoutRegistry, LibraryHandle,
    LoadFlags, Record, Value,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Declarations for the reference test library. The library path is
/// filled in at run time.
const TESTLIB_DECLARATIONS: &str = r#"
layouts:
  - name: MyCString
    fields:
      len: uint32
      ptr: string
  - name: MyCStringArray
    fields:
      len: uint32
      ptr: "ptr_array<MyCString, len>"
libraries:
  - name: testlib
    functions:
      initialize: { returns: int32, params: [string] }
      testbyvalue: { returns: int32, params: ["struct<MyCString>"] }
      testbyref: { returns: int32, params: ["ptr<MyCString>"] }
      testretstring: { returns: "struct<MyCString>", params: ["ptr<MyCString>"] }
      testretarray: { returns: "struct<MyCStringArray>", params: ["struct<MyCString>"] }
      testfreearray: { params: ["struct<MyCStringArray>"] }
"#;

const GREETING: &str = "Hello from cmarshal-testlib";

type CheckResult = std::result::Result<String, String>;
type CallResult = std::result::Result<Value, String>;

#[derive(Debug, Serialize)]
struct Check {
    name: String,
    passed: bool,
    detail: String,
    duration_us: u64,
}

fn run_check(name: &str, f: impl FnOnce() -> CheckResult) -> Check {
    let timer = Timer::with_details("smoke_check", name);
    let outcome = f();
    let duration_us = timer.elapsed().as_micros() as u64;
    match &outcome {
        Ok(detail) => tracing::info!(check = name, %detail, "smoke check passed"),
        Err(detail) => tracing::warn!(check = name, %detail, "smoke check failed"),
    }
    let (passed, detail) = match outcome {
        Ok(detail) => (true, detail),
        Err(detail) => (false, detail),
    };
    Check {
        name: name.to_string(),
        passed,
        detail,
        duration_us,
    }
}

fn expect(actual: Value, expected: Value) -> CheckResult {
    if actual == expected {
        Ok(actual.to_string())
    } else {
        Err(format!("expected {}, got {}", expected, actual))
    }
}

fn bind(
    library: &LibraryHandle,
    symbol: &str,
    returns: &str,
    params: &[&str],
) -> cmarshal_core::Result<BoundFunction> {
    let signature =
        FunctionSignature::parse(&LayoutRegistry::new(), returns, params.iter().copied())?;
    BoundFunction::bind(library, symbol, signature)
}

/// Math library shipped with the platform
fn default_libm() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("libm.so.6")
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from("libm.dylib")
    }
    #[cfg(target_os = "windows")]
    {
        PathBuf::from("ucrtbase.dll")
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        PathBuf::from(cmarshal_core::platform_lib_name("m"))
    }
}

fn check_ceil(libm: &Path) -> CheckResult {
    let library = LibraryHandle::open(Some(libm), LoadFlags::default()).map_err(|e| e.to_string())?;
    let ceil = bind(&library, "ceil", "double", &["double"]).map_err(|e| e.to_string())?;
    let result = unsafe { ceil.call(&mut [Value::Float(3.5)]) }.map_err(|e| e.to_string())?;
    expect(result, Value::Float(4.0))
}

fn check_atoi() -> CheckResult {
    let process = LibraryHandle::current_process().map_err(|e| e.to_string())?;
    let atoi = bind(&process, "atoi", "int32", &["string"]).map_err(|e| e.to_string())?;
    let result = unsafe { atoi.call(&mut [Value::from("1234")]) }.map_err(|e| e.to_string())?;
    expect(result, Value::Int(1234))
}

#[cfg(unix)]
fn check_gettimeofday() -> CheckResult {
    use cmarshal_core::FieldSpec;

    let mut registry = LayoutRegistry::new();
    let timeval = registry
        .define_layout(
            "TimeVal",
            [FieldSpec::new("tv_sec", "long"), FieldSpec::new("tv_usec", "long")],
        )
        .map_err(|e| e.to_string())?;
    let process = LibraryHandle::current_process().map_err(|e| e.to_string())?;
    let signature = FunctionSignature::parse(&registry, "int32", ["ptr<TimeVal>", "pointer"])
        .map_err(|e| e.to_string())?;
    let gettimeofday =
        BoundFunction::bind(&process, "gettimeofday", signature).map_err(|e| e.to_string())?;

    let mut args = [Value::Record(Record::new(timeval)), Value::null()];
    let status = unsafe { gettimeofday.call(&mut args) }.map_err(|e| e.to_string())?;
    expect(status, Value::Int(0))?;

    let tv_sec = args[0]
        .as_record()
        .and_then(|tv| tv.get("tv_sec").ok())
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if tv_sec > 0 {
        Ok(args[0].to_string())
    } else {
        Err(format!("tv_sec not filled in: {}", args[0]))
    }
}

/// Struct-marshaling checks against the reference test library
fn testlib_checks(path: &Path, search_dirs: &[PathBuf], checks: &mut Vec<Check>) {
    let loaded = Declarations::from_yaml(TESTLIB_DECLARATIONS).and_then(|mut declarations| {
        declarations.libraries[0].path = Some(path.to_path_buf());
        declarations.load(search_dirs)
    });
    let loaded = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            checks.push(run_check("testlib bind", || Err(e.to_string())));
            return;
        }
    };
    let registry = &loaded.registry;
    let Some(table) = loaded.table("testlib") else {
        checks.push(run_check("testlib bind", || Err("no table bound".to_string())));
        return;
    };

    let hello = || -> std::result::Result<Record, String> {
        let layout = registry.layout("MyCString").map_err(|e| e.to_string())?;
        Record::new(layout)
            .with("len", 7u32)
            .and_then(|r| r.with("ptr", "Hello, world"))
            .map_err(|e| e.to_string())
    };

    checks.push(run_check("testlib initialize", || {
        let result = invoke(table, "initialize", &mut [Value::from("/tmp/rosie")])?;
        expect(result, Value::Int(0))
    }));

    checks.push(run_check("testlib by value", || {
        let original = hello()?;
        let mut args = [Value::Record(original.clone())];
        expect(invoke(table, "testbyvalue", &mut args)?, Value::Int(14))?;
        if args[0] != Value::Record(original) {
            return Err(format!("caller copy changed: {}", args[0]));
        }
        Ok("callee doubled its copy; caller still has len 7".to_string())
    }));

    checks.push(run_check("testlib by reference", || {
        let mut args = [Value::Record(hello()?)];
        expect(invoke(table, "testbyref", &mut args)?, Value::Int(7))?;
        let len = args[0].as_record().and_then(|r| r.get("len").ok()).cloned();
        match len {
            Some(Value::UInt(0)) => Ok(args[0].to_string()),
            other => Err(format!("expected len 0 after the call, got {:?}", other)),
        }
    }));

    checks.push(run_check("testlib returned string", || {
        let returned = invoke(table, "testretstring", &mut [Value::Record(hello()?)])?;
        let text = returned
            .as_record()
            .and_then(|r| r.get("ptr").ok())
            .and_then(Value::as_str)
            .map(str::to_string);
        match text {
            Some(text) if text == GREETING => Ok(returned.to_string()),
            other => Err(format!("unexpected string {:?}", other)),
        }
    }));

    checks.push(run_check("testlib pointer array", || {
        let returned = invoke(table, "testretarray", &mut [Value::Record(hello()?)])?;
        let names = returned
            .as_record()
            .ok_or_else(|| "expected a record".to_string())
            .and_then(|array| {
                let elements = unsafe { array.elements("ptr") }.map_err(|e| e.to_string())?;
                elements
                    .to_records()
                    .map_err(|e| e.to_string())
                    .map(|records| {
                        records
                            .iter()
                            .map(|r| {
                                let name = r.get("ptr").ok().and_then(Value::as_str);
                                name.unwrap_or_default().to_string()
                            })
                            .collect::<Vec<_>>()
                    })
            });
        invoke(table, "testfreearray", &mut [returned])?;
        match names {
            Ok(names) if names == ["zero", "one", "two"] => Ok(names.join(", ")),
            Ok(names) => Err(format!("unexpected elements {:?}", names)),
            Err(e) => Err(e),
        }
    }));
}

fn invoke(table: &FunctionTable, name: &str, args: &mut [Value]) -> CallResult {
    let function = table
        .function(name)
        .ok_or_else(|| format!("'{}' is not bound", name))?;
    unsafe { function.call(args) }.map_err(|e| e.to_string())
}

/// Handle the smoke command
pub fn handle_smoke(args: SmokeArgs, config: &Config, output: &mut OutputWriter) -> Result<()> {
    let libm = args.libm.unwrap_or_else(default_libm);
    let testlib = args.testlib.or_else(|| config.libraries.testlib.clone());
    let search_dirs = config.search_dirs(&[]);

    let mut checks = vec![
        run_check("libm ceil", || check_ceil(&libm)),
        run_check("process atoi", check_atoi),
    ];
    #[cfg(unix)]
    checks.push(run_check("process gettimeofday", check_gettimeofday));

    match &testlib {
        Some(path) => testlib_checks(path, &search_dirs, &mut checks),
        None => output.info("No test library configured; skipping struct checks (use --testlib)")?,
    }

    let failed = checks.iter().filter(|c| !c.passed).count();
    let total = checks.len();

    if output.is_human() {
        let rows = checks
            .iter()
            .map(|c| {
                vec![
                    c.name.clone(),
                    if c.passed { "ok" } else { "FAILED" }.to_string(),
                    c.detail.clone(),
                ]
            })
            .collect();
        output.table(&["check", "status", "detail"], rows)?;
    } else {
        output.data(&checks)?;
    }

    if failed > 0 {
        output.error(&format!("✗ {} of {} smoke checks failed", failed, total))?;
        return Err(Error::SmokeFailed { failed, total });
    }
    output.success(&format!("✓ All {} smoke checks passed", total))
}
