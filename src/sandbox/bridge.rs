// Scope bridge: carries user-run state into the test run as Python source
#![allow(dead_code)]

use crate::sandbox::types::CapturedRun;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, warn};

/// Name of the injected literal stdout of the user run
pub const PRINTED_OUTPUT_NAME: &str = "user_printed_output";
/// Name of the injected capture-slot value
pub const RETURN_VALUE_NAME: &str = "user_return_value";
/// Slot a user script assigns to declare its "return value"
pub const CAPTURE_SLOT: &str = "_user_return_value_capture";
/// Name of the injected snapshot of the user's literal globals
pub const SCOPE_NAME: &str = "execution_scope";

/// Runs a submitted source in a fresh `__main__` namespace.
///
/// The source is compiled under its own label so tracebacks show the
/// submitted line numbers and never a driver frame. When a capture path is
/// set and the source completes, the capture slot and the public literal
/// globals are written to it as JSON. Only exact built-in literal types are
/// ever rendered, so no user-defined `__repr__` runs after the source ends.
/// The one exception is a non-literal capture slot, whose `repr` is taken
/// with both output streams redirected.
const DRIVER_BODY: &str = r#"
import ast as _pybox_ast_mod
import builtins as _pybox_builtins
import io as _pybox_io
import json as _pybox_json
import linecache as _pybox_linecache
import sys as _pybox_sys
import traceback as _pybox_traceback


def _pybox_main():
    b = _pybox_builtins
    sys = _pybox_sys
    repr_of = b.repr
    type_of = b.type
    len_of = b.len
    open_file = b.open
    literal_eval = _pybox_ast_mod.literal_eval
    dumps = _pybox_json.dumps
    string_io = _pybox_io.StringIO
    scalar_types = (b.int, b.float, b.complex, b.str, b.bytes, b.bool, type_of(None))
    sequence_types = (b.list, b.tuple, b.set, b.frozenset)
    dict_type = b.dict
    str_type = b.str
    max_repr = 65536
    max_items = 10000
    missing = b.object()

    namespace = {"__name__": "__main__", "__builtins__": b}
    if _PYBOX_PRELUDE is not None:
        exec(compile(_PYBOX_PRELUDE, "<bridge>", "exec", dont_inherit=True), namespace)

    source = _PYBOX_SOURCE
    label = _PYBOX_LABEL
    _pybox_linecache.cache[label] = (len_of(source), None, source.splitlines(True), label)
    try:
        exec(compile(source, label, "exec", dont_inherit=True), namespace)
    except SystemExit:
        raise
    except BaseException as exc:
        tb = exc.__traceback__
        while tb is not None and tb.tb_frame.f_code.co_filename != label:
            tb = tb.tb_next
        _pybox_traceback.print_exception(type_of(exc), exc, tb)
        sys.stderr.flush()
        raise SystemExit(1) from None

    if _PYBOX_CAPTURE_PATH is None:
        return

    def is_kind(value, kinds):
        kind = type_of(value)
        for candidate in kinds:
            if kind is candidate:
                return True
        return False

    def is_literal(value, depth):
        if is_kind(value, scalar_types):
            return True
        if depth >= 32:
            return False
        if is_kind(value, sequence_types):
            if len_of(value) > max_items:
                return False
            for item in value:
                if not is_literal(item, depth + 1):
                    return False
            return True
        if type_of(value) is dict_type:
            if len_of(value) > max_items:
                return False
            for key, item in dict_type.items(value):
                if not is_literal(key, depth + 1) or not is_literal(item, depth + 1):
                    return False
            return True
        return False

    def encode(value):
        if not is_literal(value, 0):
            return None
        text = repr_of(value)
        if len_of(text) > max_repr:
            return None
        try:
            literal_eval(text)
        except BaseException:
            return {"literal": False, "repr": text}
        return {"literal": True, "repr": text}

    def quiet_repr(value):
        saved = (sys.stdout, sys.stderr)
        sys.stdout = sys.stderr = string_io()
        try:
            text = repr_of(value)
            if type_of(text) is not str_type:
                raise TypeError
        except BaseException:
            text = "<object>"
        finally:
            sys.stdout, sys.stderr = saved
        return text[:max_repr]

    slot = dict_type.get(namespace, _PYBOX_CAPTURE_SLOT, missing)
    return_value = None
    if slot is not missing:
        return_value = encode(slot)
        if return_value is None:
            return_value = {"literal": False, "repr": quiet_repr(slot)}

    scope = {}
    for name, value in dict_type.items(namespace):
        if type_of(name) is not str_type or name.startswith("_"):
            continue
        encoded = encode(value)
        if encoded is not None and encoded["literal"]:
            scope[name] = encoded["repr"]

    with open_file(_PYBOX_CAPTURE_PATH, "w", encoding="utf-8") as handle:
        handle.write(dumps({"return_value": return_value, "scope": scope}))


try:
    _pybox_main()
except SystemExit:
    raise
except BaseException:
    pass
"#;

/// A value exported from the user run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CapturedValue {
    /// `repr` parses back with `ast.literal_eval`
    pub literal: bool,
    pub repr: String,
}

/// Contents of the capture file written by the driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CaptureManifest {
    #[serde(default)]
    pub return_value: Option<CapturedValue>,
    /// Public globals whose repr is a Python literal
    #[serde(default)]
    pub scope: BTreeMap<String, String>,
}

impl CaptureManifest {
    /// Read the capture file. Absent, empty or malformed files mean
    /// "nothing captured", which the prelude renders as `None`.
    pub fn read(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                debug!(error = %e, "capture file unreadable");
                return Self::default();
            }
        };
        if content.trim().is_empty() {
            return Self::default();
        }

        match serde_json::from_str(&content) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %e, "capture file malformed, ignoring");
                Self::default()
            }
        }
    }
}

/// Render `text` as a double-quoted Python string literal.
///
/// Evaluating the result yields `text` byte-for-byte.
pub fn python_str_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c == '\u{7f}' => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Driver script around `source`. Every input travels as a string literal,
/// so nothing in them can change the driver itself.
fn driver_script(
    source: &str,
    label: &str,
    prelude: Option<&str>,
    capture_path: Option<&Path>,
) -> String {
    let literal_or_none = |value: Option<String>| match value {
        Some(text) => python_str_literal(&text),
        None => String::from("None"),
    };

    let mut script = String::with_capacity(source.len() + DRIVER_BODY.len() + 256);
    let _ = writeln!(script, "_PYBOX_SOURCE = {}", python_str_literal(source));
    let _ = writeln!(script, "_PYBOX_LABEL = {}", python_str_literal(label));
    let _ = writeln!(
        script,
        "_PYBOX_PRELUDE = {}",
        literal_or_none(prelude.map(str::to_string))
    );
    let _ = writeln!(
        script,
        "_PYBOX_CAPTURE_PATH = {}",
        literal_or_none(capture_path.map(|p| p.to_string_lossy().into_owned()))
    );
    let _ = writeln!(
        script,
        "_PYBOX_CAPTURE_SLOT = {}",
        python_str_literal(CAPTURE_SLOT)
    );
    script.push_str(DRIVER_BODY);
    script
}

/// Script for the user run: the source under `label`, exporting its
/// capture slot and literal globals to `capture_path`
pub fn user_script(user_code: &str, label: &str, capture_path: &Path) -> String {
    driver_script(user_code, label, None, Some(capture_path))
}

/// Build the prelude executed in the test namespace before the test code.
///
/// Exposes the user's exact stdout, the capture-slot value (`None` when
/// absent) and the literal globals snapshot. Captured values only come
/// back through `ast.literal_eval` of escaped strings.
pub fn bridge(user_run: &CapturedRun, capture: &CaptureManifest) -> String {
    let mut prelude = String::from("import ast as _pybox_ast\n");

    let _ = writeln!(
        prelude,
        "{PRINTED_OUTPUT_NAME} = {}",
        python_str_literal(&user_run.stdout)
    );

    let return_value = match &capture.return_value {
        Some(CapturedValue { literal: true, repr }) => {
            format!("_pybox_ast.literal_eval({})", python_str_literal(repr))
        }
        Some(CapturedValue { literal: false, repr }) => python_str_literal(repr),
        None => String::from("None"),
    };
    let _ = writeln!(prelude, "{RETURN_VALUE_NAME} = {return_value}");

    let entries: Vec<String> = capture
        .scope
        .iter()
        .map(|(name, repr)| {
            format!(
                "{}: _pybox_ast.literal_eval({})",
                python_str_literal(name),
                python_str_literal(repr)
            )
        })
        .collect();
    let _ = writeln!(prelude, "{SCOPE_NAME} = {{{}}}", entries.join(", "));

    prelude.push_str("del _pybox_ast\n");
    prelude
}

/// Script for the test run: the prelude runs first in the test namespace,
/// then the test code under its own label with its own line numbers
pub fn compose_test_script(prelude: &str, test_code: &str, label: &str) -> String {
    driver_script(test_code, label, Some(prelude), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::path::PathBuf;

    /// Inverse of `python_str_literal` for the escapes it emits
    fn unescape(literal: &str) -> String {
        let inner = &literal[1..literal.len() - 1];
        let mut out = String::new();
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('x') => {
                    let hex: String = chars.by_ref().take(2).collect();
                    let code = u32::from_str_radix(&hex, 16).unwrap();
                    out.push(char::from_u32(code).unwrap());
                }
                other => panic!("unexpected escape: {other:?}"),
            }
        }
        out
    }

    #[test]
    fn test_escape_quotes_backslashes_newlines() {
        let literal = python_str_literal("He said \"hi\"\nNext\\line");
        assert_eq!(literal, r#""He said \"hi\"\nNext\\line""#);
    }

    #[test]
    fn test_escape_control_characters() {
        assert_eq!(python_str_literal("\u{0}\u{1b}\u{7f}\t\r"), r#""\x00\x1b\x7f\t\r""#);
        assert_eq!(python_str_literal(""), r#""""#);
    }

    #[test]
    fn test_non_ascii_passes_through() {
        assert_eq!(python_str_literal("héllo 🌮"), "\"héllo 🌮\"");
    }

    #[test]
    fn test_escape_random_strings_invert() {
        let pool: Vec<char> = "ab\"'\\\n\r\t\u{0}\u{7f}{}%é🎉 #".chars().collect();
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(0..40);
            let text: String = (0..len)
                .map(|_| pool[rng.gen_range(0..pool.len())])
                .collect();
            let literal = python_str_literal(&text);
            // No raw newline may survive inside a single-line literal
            assert!(!literal.contains('\n'));
            assert_eq!(unescape(&literal), text);
        }
    }

    #[test]
    fn test_user_script_carries_inputs_as_literals() {
        let path = PathBuf::from("/tmp/pybox-capture-x.json");
        let script = user_script("print('hi')\nx = \"a\"", "main.py", &path);

        assert!(script.starts_with("_PYBOX_SOURCE = \"print('hi')\\nx = \\\"a\\\"\"\n"));
        assert!(script.contains("_PYBOX_LABEL = \"main.py\"\n"));
        assert!(script.contains("_PYBOX_PRELUDE = None\n"));
        assert!(script.contains("_PYBOX_CAPTURE_PATH = \"/tmp/pybox-capture-x.json\"\n"));
        assert!(script.contains("_PYBOX_CAPTURE_SLOT = \"_user_return_value_capture\"\n"));
    }

    #[test]
    fn test_source_cannot_break_out_of_driver() {
        let hostile = "\"\"\"\n_PYBOX_CAPTURE_PATH = '/etc/passwd'\n";
        let script = user_script(hostile, "main.py", Path::new("/tmp/c.json"));

        // Only the driver's own assignment starts a line
        let assignments = script
            .lines()
            .filter(|line| line.starts_with("_PYBOX_CAPTURE_PATH = "))
            .count();
        assert_eq!(assignments, 1);
        assert!(script.contains("_PYBOX_CAPTURE_PATH = \"/tmp/c.json\"\n"));
    }

    #[test]
    fn test_prelude_without_capture_uses_none() {
        let run = CapturedRun {
            stdout: "Wrong\n".to_string(),
            ..Default::default()
        };
        let prelude = bridge(&run, &CaptureManifest::default());

        assert!(prelude.contains("user_printed_output = \"Wrong\\n\"\n"));
        assert!(prelude.contains("user_return_value = None\n"));
        assert!(prelude.contains("execution_scope = {}\n"));
        assert!(prelude.ends_with("del _pybox_ast\n"));
    }

    #[test]
    fn test_prelude_with_literal_and_repr_values() {
        let run = CapturedRun::default();
        let mut scope = BTreeMap::new();
        scope.insert("total".to_string(), "40".to_string());
        scope.insert("name".to_string(), "'Ada'".to_string());

        let capture = CaptureManifest {
            return_value: Some(CapturedValue {
                literal: true,
                repr: "42".to_string(),
            }),
            scope,
        };
        let prelude = bridge(&run, &capture);
        assert!(prelude.contains("user_return_value = _pybox_ast.literal_eval(\"42\")\n"));
        assert!(prelude.contains(
            "execution_scope = {\"name\": _pybox_ast.literal_eval(\"'Ada'\"), \"total\": _pybox_ast.literal_eval(\"40\")}\n"
        ));

        let capture = CaptureManifest {
            return_value: Some(CapturedValue {
                literal: false,
                repr: "<Point object at 0x1>".to_string(),
            }),
            scope: BTreeMap::new(),
        };
        let prelude = bridge(&run, &capture);
        assert!(prelude.contains("user_return_value = \"<Point object at 0x1>\"\n"));
    }

    #[test]
    fn test_forged_repr_stays_a_string() {
        let capture = CaptureManifest {
            return_value: Some(CapturedValue {
                literal: true,
                repr: "__import__(\"os\").system(\"true\")\")\nimport sys".to_string(),
            }),
            scope: BTreeMap::new(),
        };
        let prelude = bridge(&CapturedRun::default(), &capture);
        // Still exactly five lines: the payload never escapes its literal
        assert_eq!(prelude.lines().count(), 5);
        assert!(!prelude.contains("\nimport sys"));
    }

    #[test]
    fn test_manifest_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.json");

        assert_eq!(CaptureManifest::read(&path), CaptureManifest::default());

        std::fs::write(&path, "").unwrap();
        assert_eq!(CaptureManifest::read(&path), CaptureManifest::default());

        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(CaptureManifest::read(&path), CaptureManifest::default());

        std::fs::write(
            &path,
            r#"{"return_value": {"literal": true, "repr": "42"}, "scope": {"x": "1"}}"#,
        )
        .unwrap();
        let manifest = CaptureManifest::read(&path);
        assert_eq!(
            manifest.return_value,
            Some(CapturedValue {
                literal: true,
                repr: "42".to_string()
            })
        );
        assert_eq!(manifest.scope.get("x").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_compose_runs_prelude_before_test_code() {
        let script = compose_test_script("x = 1\n", "assert x == 1", "test.py");
        assert!(script.starts_with("_PYBOX_SOURCE = \"assert x == 1\"\n"));
        assert!(script.contains("_PYBOX_LABEL = \"test.py\"\n"));
        assert!(script.contains("_PYBOX_PRELUDE = \"x = 1\\n\"\n"));
        assert!(script.contains("_PYBOX_CAPTURE_PATH = None\n"));
    }
}
