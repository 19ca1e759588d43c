//! Expression assembly.
//!
//! Turns an [`ExpressionSpec`] into one expression body plus the ordered list
//! of values it refers to. Code segments are spliced verbatim; every other
//! segment becomes a parameter and is replaced in the body by a reference
//! token derived from its position (`__t0`, `__t1`, ...). The engine wraps the
//! body as a callable taking the [`CAPABILITY`] parameter followed by the
//! reference parameters, in order.

use crate::engine::ScriptEngine;
use crate::error::EvalError;
use crate::handles::HandleTable;
use crate::transport::protocol::{ExpressionSpec, Segment};

/// Name of the implicit runtime-capability parameter.
pub const CAPABILITY: &str = "rt";

/// An expression ready to be compiled.
#[derive(Debug, Clone)]
pub struct Assembled<V> {
    /// Expression source with references in place of literals.
    pub body: String,
    /// Reference names, one per injected value.
    pub params: Vec<String>,
    /// Injected values, in parameter order.
    pub args: Vec<V>,
}

impl<V> Assembled<V> {
    /// Formal parameter list of the wrapping callable.
    pub fn formals(&self) -> Vec<&str> {
        std::iter::once(CAPABILITY)
            .chain(self.params.iter().map(String::as_str))
            .collect()
    }
}

/// Reference token for the parameter at `index`.
pub fn reference(index: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut digits = Vec::new();
    let mut n = index;
    loop {
        digits.push(DIGITS[n % 36]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    digits.reverse();
    format!("__t{}", String::from_utf8_lossy(&digits))
}

/// Decode every segment and build the expression.
///
/// Fails with [`EvalError::MalformedExpression`] before anything runs if any
/// segment cannot be decoded.
pub fn assemble<E: ScriptEngine>(
    expression: ExpressionSpec,
    engine: &E,
    table: &HandleTable<E::Value>,
) -> Result<Assembled<E::Value>, EvalError> {
    let mut body = String::new();
    let mut params = Vec::new();
    let mut args = Vec::new();

    for segment in expression {
        let value = match segment {
            Segment::Code(code) => {
                body.push_str(&code);
                continue;
            }
            Segment::BufferLiteral(bytes) => engine.binary(bytes),
            Segment::StringLiteral(bytes) => {
                let text = String::from_utf8(bytes).map_err(|e| {
                    EvalError::MalformedExpression(format!("string literal is not UTF-8: {e}"))
                })?;
                engine.text(text)
            }
            Segment::JsonLiteral(bytes) => {
                let parsed = serde_json::from_slice(&bytes).map_err(|e| {
                    EvalError::MalformedExpression(format!("invalid JSON literal: {e}"))
                })?;
                engine.json(parsed)?
            }
            Segment::HandleLiteral(handle) => table.lookup(handle)?.clone(),
        };
        let name = reference(args.len());
        body.push_str(&name);
        params.push(name);
        args.push(value);
    }

    Ok(Assembled { body, params, args })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RhaiEngine;
    use crate::config::EngineLimits;

    fn engine() -> RhaiEngine {
        RhaiEngine::new(&EngineLimits::default(), std::path::Path::new("."))
    }

    #[test]
    fn reference_names_are_base36() {
        assert_eq!(reference(0), "__t0");
        assert_eq!(reference(9), "__t9");
        assert_eq!(reference(10), "__ta");
        assert_eq!(reference(35), "__tz");
        assert_eq!(reference(36), "__t10");
    }

    #[test]
    fn code_only_has_no_params() {
        let engine = engine();
        let table = HandleTable::new();
        let assembled = assemble(vec![Segment::Code("1 + 1".into())], &engine, &table).unwrap();
        assert_eq!(assembled.body, "1 + 1");
        assert!(assembled.args.is_empty());
        assert_eq!(assembled.formals(), vec!["rt"]);
    }

    #[test]
    fn literals_are_numbered_left_to_right() {
        let engine = engine();
        let mut table = HandleTable::new();
        let h = table.allocate(rhai::Dynamic::from(5_i64));
        let spec = vec![
            Segment::Code("[".into()),
            Segment::StringLiteral(b"a".to_vec()),
            Segment::Code(", ".into()),
            Segment::JsonLiteral(b"[1,2]".to_vec()),
            Segment::Code(", ".into()),
            Segment::HandleLiteral(h),
            Segment::Code(", ".into()),
            Segment::BufferLiteral(vec![1]),
            Segment::Code("]".into()),
        ];
        let assembled = assemble(spec, &engine, &table).unwrap();
        assert_eq!(assembled.body, "[__t0, __t1, __t2, __t3]");
        assert_eq!(assembled.formals(), vec!["rt", "__t0", "__t1", "__t2", "__t3"]);
        assert_eq!(assembled.args.len(), 4);
        assert_eq!(assembled.args[2].as_int(), Ok(5));
    }

    #[test]
    fn bad_json_is_malformed() {
        let engine = engine();
        let table = HandleTable::new();
        let err = assemble(vec![Segment::JsonLiteral(b"{nope".to_vec())], &engine, &table)
            .unwrap_err();
        assert!(matches!(err, EvalError::MalformedExpression(_)));
    }

    #[test]
    fn unknown_handle_is_malformed() {
        let engine = engine();
        let table = HandleTable::new();
        let err = assemble(vec![Segment::HandleLiteral(3)], &engine, &table).unwrap_err();
        assert_eq!(
            err,
            EvalError::MalformedExpression("invalid handle 3".to_string())
        );
    }

    #[test]
    fn invalid_utf8_string_is_malformed() {
        let engine = engine();
        let table = HandleTable::new();
        let err = assemble(vec![Segment::StringLiteral(vec![0xff, 0xfe])], &engine, &table)
            .unwrap_err();
        assert!(matches!(err, EvalError::MalformedExpression(_)));
    }
}
